//! Assembling a running relay from configuration
//!
//! A [`Point`] is one relay process: outbound handlers built from
//! configuration and added to a dispatcher, inbound handlers built
//! around that dispatcher and started in order.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::dispatch::{
    Dispatcher, InboundContext, InboundHandler, OutboundContext, Registry,
};
use crate::error::{ConfigError, DispatchError};

/// A configured relay instance.
pub struct Point {
    dispatcher: Arc<Dispatcher>,
    inbounds: Vec<Arc<dyn InboundHandler>>,
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Point").finish_non_exhaustive()
    }
}

impl Point {
    /// Build all handlers from `config` using `registry`. Configuration
    /// mistakes surface here, before any socket is bound.
    pub fn new(config: &Config, registry: &Registry) -> Result<Self, ConfigError> {
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::new());
        for outbound in &config.outbounds {
            let handler = registry.create_outbound(
                &outbound.protocol,
                OutboundContext {
                    tag: outbound.tag.clone(),
                    settings: outbound.settings.clone(),
                    transport: outbound.transport.clone(),
                },
            )?;
            info!("outbound {} ({}) ready", outbound.tag, outbound.protocol);
            dispatcher.add_handler(handler);
        }

        let mut inbounds: Vec<Arc<dyn InboundHandler>> = Vec::new();
        for inbound in &config.inbounds {
            let handler = registry.create_inbound(
                &inbound.protocol,
                InboundContext {
                    tag: inbound.tag.clone(),
                    listen: inbound.listen_addr(),
                    settings: inbound.settings.clone(),
                    transport: inbound.transport.clone(),
                    dispatcher: Arc::clone(&dispatcher),
                },
            )?;
            inbounds.push(handler);
        }

        Ok(Self {
            dispatcher,
            inbounds,
        })
    }

    /// Start every inbound handler.
    pub async fn start(&self) -> Result<(), DispatchError> {
        for inbound in &self.inbounds {
            Arc::clone(inbound).start().await?;
        }
        info!("{} inbound handler(s) running", self.inbounds.len());
        Ok(())
    }

    /// Stop accepting new sessions.
    pub fn close(&self) {
        for inbound in &self.inbounds {
            inbound.close();
        }
    }

    /// The dispatcher shared by all inbounds.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::dispatch::default_registry;

    #[tokio::test]
    async fn test_build_from_default_style_config() {
        let config = crate::config::default_config();
        let point = Point::new(&config, default_registry()).unwrap();
        assert!(point.dispatcher().default_handler().is_some());
    }

    #[test]
    fn test_unknown_protocol_fails_at_build() {
        let config = load_config_str(
            r#"{ "outbounds": [{ "tag": "x", "protocol": "vmess-not-here" }] }"#,
        )
        .unwrap();
        let err = Point::new(&config, default_registry()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownName { .. }));
    }
}
