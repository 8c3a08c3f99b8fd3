//! Configuration schema

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transport::TransportSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Logging options
    pub log: LogConfig,
    /// Inbound handlers, in start order
    pub inbounds: Vec<InboundConfig>,
    /// Outbound handlers; the first is the default
    pub outbounds: Vec<OutboundConfig>,
}

impl Config {
    /// Validate everything that can be checked before sockets are bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbounds.is_empty() {
            return Err(ConfigError::validation(
                "at least one outbound is required",
            ));
        }
        for inbound in &self.inbounds {
            if inbound.port == 0 {
                return Err(ConfigError::validation(format!(
                    "inbound {} needs a listen port",
                    inbound.tag
                )));
            }
            inbound.transport.kcp.validate()?;
        }
        for outbound in &self.outbounds {
            outbound.transport.kcp.validate()?;
        }
        Ok(())
    }
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// Filter directive, `RUST_LOG` style
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// One inbound handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundConfig {
    /// Tag, used in logs and routing
    pub tag: String,
    /// Protocol name in the registry
    pub protocol: String,
    /// Listen address
    pub listen: IpAddr,
    /// Listen port
    pub port: u16,
    /// Protocol-specific settings
    pub settings: serde_json::Value,
    /// Wire transport
    pub transport: TransportSettings,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            tag: String::new(),
            protocol: String::new(),
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            settings: serde_json::Value::Null,
            transport: TransportSettings::default(),
        }
    }
}

impl InboundConfig {
    /// The socket address to bind.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }
}

/// One outbound handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutboundConfig {
    /// Tag, used in logs and routing
    pub tag: String,
    /// Protocol name in the registry
    pub protocol: String,
    /// Protocol-specific settings
    pub settings: serde_json::Value,
    /// Wire transport
    pub transport: TransportSettings,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            tag: String::new(),
            protocol: String::new(),
            settings: serde_json::Value::Null,
            transport: TransportSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_outbounds_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inbound_needs_port() {
        let config = Config {
            inbounds: vec![InboundConfig {
                tag: "in".into(),
                protocol: "dokodemo-door".into(),
                ..Default::default()
            }],
            outbounds: vec![OutboundConfig {
                tag: "out".into(),
                protocol: "freedom".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kcp_options_validated() {
        let mut config = Config {
            outbounds: vec![OutboundConfig {
                tag: "out".into(),
                protocol: "freedom".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        config.outbounds[0].transport.kcp.mtu = 100;
        assert!(config.validate().is_err());
    }
}
