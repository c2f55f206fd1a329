//! Error types
//!
//! Defines the error taxonomy for the connection pool, sessions, and the
//! underlying FTP transport.

use std::fmt;
use std::io;

/// Errors surfaced by the pool, session, and connection layers.
///
/// Nothing in this crate retries on its own; every failure propagates to
/// the caller, who decides whether the operation is worth retrying.
#[derive(Debug)]
pub enum PoolError {
    /// Missing, unparsable, or out-of-range configuration property.
    Configuration(String),
    /// The transport connection could not be established or maintained:
    /// socket errors, unexpected EOF, or a malformed control-channel reply.
    Connectivity(String),
    /// The server returned an error reply not refined into a more specific
    /// variant. Carries the raw reply code.
    ProtocolFault { code: u16, message: String },
    /// Server fault 550: the requested file or directory is unavailable.
    NotFound(String),
    /// Server fault 553: the requested name is not allowed.
    NameNotAllowed(String),
    /// No idle connection available and the pool is at maximum capacity.
    /// Reported synchronously; the pool never queues waiting callers.
    PoolExhausted,
    /// Operation attempted on a session after `close()`.
    SessionClosed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            PoolError::Connectivity(msg) => write!(f, "Connectivity error: {}", msg),
            PoolError::ProtocolFault { code, message } => {
                write!(f, "Protocol fault {}: {}", code, message)
            }
            PoolError::NotFound(what) => write!(f, "Not found: {}", what),
            PoolError::NameNotAllowed(what) => write!(f, "Name not allowed: {}", what),
            PoolError::PoolExhausted => write!(f, "Connection pool exhausted"),
            PoolError::SessionClosed => write!(f, "Session is closed"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<io::Error> for PoolError {
    fn from(error: io::Error) -> Self {
        PoolError::Connectivity(error.to_string())
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(error: config::ConfigError) -> Self {
        PoolError::Configuration(error.to_string())
    }
}
