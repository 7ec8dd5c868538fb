//! Error types for the proxy.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by proxy control operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A delay value was negative, NaN or infinite.
    #[error("invalid delay: {value} (must be a finite, non-negative number of seconds)")]
    InvalidDelay { value: f64 },

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The upstream target could not be reached.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The operation needs a listening proxy.
    #[error("proxy is not started")]
    NotStarted,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Returns true if this error is a bounded-operation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. })
    }

    /// Returns true if this error is an upstream connection failure.
    pub fn is_connect(&self) -> bool {
        matches!(self, ProxyError::Connect { .. })
    }
}

/// Result alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
