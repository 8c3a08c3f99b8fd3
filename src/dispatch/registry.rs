//! Named handler factories
//!
//! Inbound and outbound protocols register constructors under a protocol
//! name; configuration refers to them by that name. Registration is
//! startup-only and duplicates fail loudly there, never at first use. The
//! registry is an explicit value threaded through construction; the
//! process-wide [`default_registry`] exists for the common case of one
//! registry per process.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use super::{Dispatcher, InboundHandler, OutboundHandler};
use crate::error::ConfigError;
use crate::transport::TransportSettings;

/// Everything an inbound factory gets to build a handler from.
pub struct InboundContext {
    /// Tag for the new handler
    pub tag: String,
    /// Address to listen on
    pub listen: SocketAddr,
    /// Protocol-specific settings, still undecoded
    pub settings: serde_json::Value,
    /// Wire transport for the listener
    pub transport: TransportSettings,
    /// Dispatcher the handler feeds accepted sessions into
    pub dispatcher: Arc<Dispatcher>,
}

/// Everything an outbound factory gets to build a handler from.
pub struct OutboundContext {
    /// Tag for the new handler
    pub tag: String,
    /// Protocol-specific settings, still undecoded
    pub settings: serde_json::Value,
    /// Wire transport for dialing
    pub transport: TransportSettings,
}

/// Constructor for an inbound handler.
pub type InboundFactory =
    Arc<dyn Fn(InboundContext) -> Result<Arc<dyn InboundHandler>, ConfigError> + Send + Sync>;

/// Constructor for an outbound handler.
pub type OutboundFactory =
    Arc<dyn Fn(OutboundContext) -> Result<Arc<dyn OutboundHandler>, ConfigError> + Send + Sync>;

/// Name-to-factory maps for both directions.
#[derive(Default)]
pub struct Registry {
    inbound: DashMap<String, InboundFactory>,
    outbound: DashMap<String, OutboundFactory>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in protocols.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::proxy::register_builtins(&registry)
            .expect("builtin protocol names cannot collide");
        registry
    }

    /// Register an inbound protocol. Fails when the name is taken.
    /// Registration happens at startup, before any lookup.
    pub fn register_inbound(
        &self,
        name: impl Into<String>,
        factory: InboundFactory,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.inbound.contains_key(&name) {
            return Err(ConfigError::DuplicateName { name });
        }
        self.inbound.insert(name, factory);
        Ok(())
    }

    /// Register an outbound protocol. Fails when the name is taken.
    /// Registration happens at startup, before any lookup.
    pub fn register_outbound(
        &self,
        name: impl Into<String>,
        factory: OutboundFactory,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.outbound.contains_key(&name) {
            return Err(ConfigError::DuplicateName { name });
        }
        self.outbound.insert(name, factory);
        Ok(())
    }

    /// Build an inbound handler by protocol name.
    pub fn create_inbound(
        &self,
        name: &str,
        context: InboundContext,
    ) -> Result<Arc<dyn InboundHandler>, ConfigError> {
        let factory = self
            .inbound
            .get(name)
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "inbound",
                name: name.to_string(),
            })?;
        factory(context)
    }

    /// Build an outbound handler by protocol name.
    pub fn create_outbound(
        &self,
        name: &str,
        context: OutboundContext,
    ) -> Result<Arc<dyn OutboundHandler>, ConfigError> {
        let factory = self
            .outbound
            .get(name)
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "outbound",
                name: name.to_string(),
            })?;
        factory(context)
    }
}

static DEFAULT_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::with_builtins);

/// The process-wide registry with the built-in protocols.
#[must_use]
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}
