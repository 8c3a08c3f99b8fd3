//! Error types for raynet
//!
//! Errors are grouped by subsystem. Peer-triggered conditions are always
//! survivable: a bad datagram is dropped, a timed-out read leaves the
//! connection usable. Only configuration mistakes fail startup.

use std::io;

use thiserror::Error;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum RaynetError {
    /// Configuration loading and validation
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport dialing and listening
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// KCP connection lifecycle
    #[error("kcp error: {0}")]
    Kcp(#[from] KcpError),

    /// Session dispatch
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// I/O not covered by a subsystem
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RaynetError {
    /// Whether retrying the failed operation can succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Transport(e) => e.is_recoverable(),
            Self::Kcp(e) => e.is_recoverable(),
            Self::Dispatch(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration errors. Reported at startup, never at first use.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or unreadable
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Offending path
        path: String,
    },

    /// Malformed JSON
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Out-of-range or inconsistent values
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// A handler or factory name registered twice
    #[error("duplicate registration: {name}")]
    DuplicateName {
        /// The colliding name
        name: String,
    },

    /// A referenced factory does not exist
    #[error("unknown {kind} type: {name}")]
    UnknownName {
        /// Registry kind ("inbound", "outbound")
        kind: &'static str,
        /// The missing name
        name: String,
    },

    /// I/O while reading the file
    #[error("i/o error reading configuration: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    /// Build a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Configuration problems need user intervention.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Transport-layer errors (dial, listen, stream I/O).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dial failed
    #[error("failed to connect to {dest}: {reason}")]
    ConnectFailed {
        /// Dial target
        dest: String,
        /// Underlying cause
        reason: String,
    },

    /// Dial exceeded its deadline
    #[error("connection to {dest} timed out")]
    ConnectTimeout {
        /// Dial target
        dest: String,
    },

    /// Listener socket could not be bound
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying cause
        reason: String,
    },

    /// The destination cannot be carried by this transport
    #[error("unsupported destination: {0}")]
    UnsupportedDestination(String),

    /// WebSocket handshake failure
    #[error("websocket handshake failed: {0}")]
    WebSocket(String),

    /// Stream I/O
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether retrying can succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::ConnectTimeout { .. } => true,
            Self::Bind { .. } | Self::UnsupportedDestination(_) => false,
            Self::WebSocket(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Build a connect failure.
    pub fn connect_failed(dest: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            dest: dest.into(),
            reason: reason.to_string(),
        }
    }
}

/// KCP connection errors.
#[derive(Debug, Error)]
pub enum KcpError {
    /// Read or write deadline exceeded; the connection stays usable
    #[error("read/write timeout")]
    IoTimeout,

    /// Operation on a connection past its active state
    #[error("connection closed")]
    ClosedConnection,

    /// Accept on a closed listener
    #[error("listener closed")]
    ClosedListener,

    /// No free conversation id after repeated draws
    #[error("conversation ids exhausted")]
    ConversationExhausted,

    /// Socket-level failure
    #[error("kcp i/o error: {0}")]
    Io(#[from] io::Error),
}

impl KcpError {
    /// Whether retrying can succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::IoTimeout => true,
            Self::ClosedConnection | Self::ClosedListener | Self::ConversationExhausted => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

impl From<KcpError> for io::Error {
    fn from(err: KcpError) -> Self {
        match err {
            KcpError::IoTimeout => io::Error::from(io::ErrorKind::TimedOut),
            KcpError::ClosedConnection | KcpError::ClosedListener => {
                io::Error::from(io::ErrorKind::BrokenPipe)
            }
            KcpError::ConversationExhausted => io::Error::from(io::ErrorKind::AddrInUse),
            KcpError::Io(e) => e,
        }
    }
}

/// Session dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No outbound handler under the requested tag and no default
    #[error("outbound handler not found: {tag}")]
    OutboundNotFound {
        /// Requested tag
        tag: String,
    },

    /// Inbound handler failed to start
    #[error("inbound {tag} failed to start: {reason}")]
    InboundStart {
        /// Inbound tag
        tag: String,
        /// Underlying cause
        reason: String,
    },

    /// I/O on the session path
    #[error("dispatch i/o error: {0}")]
    Io(#[from] io::Error),
}

impl DispatchError {
    /// Whether retrying can succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::OutboundNotFound { .. } => false,
            Self::InboundStart { .. } => false,
            Self::Io(_) => true,
        }
    }
}
