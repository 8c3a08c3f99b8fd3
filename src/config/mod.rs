//! Configuration types and loading
//!
//! # Example
//!
//! ```no_run
//! use raynet::config::load_config;
//!
//! let config = load_config("/etc/raynet/config.json").unwrap();
//! println!("{} inbounds", config.inbounds.len());
//! ```

mod loader;
mod types;

pub use loader::{default_config, load_config, load_config_str};
pub use types::{Config, InboundConfig, LogConfig, OutboundConfig};
