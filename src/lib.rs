//! raynet: a pluggable network-proxy relay core
//!
//! Terminates client traffic on an inbound handler, relays it through a
//! bounded duplex pipe (the *ray*), and carries it out an outbound
//! handler over a chosen wire transport. The centerpiece is a complete
//! KCP reliable-transport engine over UDP.
//!
//! # Architecture
//!
//! ```text
//! client ─► inbound handler ─► Dispatcher::dispatch() ─► Ray
//!                                 │                       │
//!                                 └──── outbound handler ─┘
//!                                          │
//!                                     transport dial
//!                                          │
//!                                 {TCP | KCP | WebSocket} ─► remote
//! ```
//!
//! # Modules
//!
//! - [`buf`]: pooled buffers, buffer sequences, the pipe loop
//! - [`ray`]: the bounded duplex stream pair behind every session
//! - [`header`]: per-datagram obfuscation and checksum wrappers
//! - [`transport`]: TCP, KCP, and WebSocket wires behind one interface
//! - [`dispatch`]: handler registry and the session dispatcher
//! - [`proxy`]: built-in freedom and dokodemo-door handlers
//! - [`collect`]: expiry-driven queue and map
//! - [`config`]: JSON configuration
//! - [`point`]: assembling a running relay
//! - [`error`]: the error hierarchy

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod buf;
pub mod collect;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod header;
pub mod net;
pub mod point;
pub mod proxy;
pub mod ray;
pub mod transport;

pub use config::{load_config, Config};
pub use dispatch::{default_registry, Dispatcher, Registry, Session};
pub use error::RaynetError;
pub use net::{Address, Destination, Network};
pub use point::Point;
pub use ray::Ray;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
