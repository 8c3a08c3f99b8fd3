//! Built-in proxy handlers
//!
//! `freedom` dials the session destination directly; `dokodemo-door`
//! forwards every accepted client to one fixed destination. Richer
//! protocol codecs plug into the same handler traits from outside the
//! core.

mod dokodemo;
mod freedom;

pub use dokodemo::DokodemoHandler;
pub use freedom::FreedomHandler;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::dispatch::Registry;
use crate::error::ConfigError;

/// Register the built-in protocols into `registry`.
pub fn register_builtins(registry: &Registry) -> Result<(), ConfigError> {
    registry.register_outbound("freedom", Arc::new(FreedomHandler::factory))?;
    registry.register_inbound("dokodemo-door", Arc::new(DokodemoHandler::factory))?;
    Ok(())
}

/// Decode protocol settings, treating absent settings as defaults.
pub(crate) fn decode_settings<T>(value: &serde_json::Value) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| ConfigError::Parse(e.to_string()))
}
