//! Error types for the broker, the relay path and the control protocol.
//!
//! Only [`BrokerError`] ever reaches a caller of the registry. [`RelayError`]
//! values are produced inside running tunnels and end up in the tunnel's
//! activity log; they never escape the tunnel that produced them.

use std::io;

/// Errors returned by [`crate::tunnel::broker::Broker`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Tunnel {0} not found")]
    NotFound(u32),

    #[error("Failed to bind local port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Invalid remote target: {0}")]
    InvalidTarget(String),

    #[error("Tunnel name may not be empty")]
    InvalidName,

    #[error("Broker is shut down")]
    Closed,
}

impl BrokerError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "TUNNEL_NOT_FOUND",
            Self::BindFailed { .. } => "BIND_FAILED",
            Self::InvalidTarget(_) => "INVALID_TARGET",
            Self::InvalidName => "INVALID_NAME",
            Self::Closed => "BROKER_CLOSED",
        }
    }
}

/// Per-session failures. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Dial {target} failed: {source}")]
    DialFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Dial {target} timed out after {timeout_ms} ms")]
    DialTimeout { target: String, timeout_ms: u128 },
}

/// Errors from the encrypted control protocol.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Malformed control message: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },

    #[error("Unknown control message type {0:#04x}")]
    UnknownType(u8),

    #[error("Control secret too short: expected at least {min} bytes, got {actual}")]
    KeyTooShort { min: usize, actual: usize },

    #[error("Control frame could not be authenticated")]
    Crypto,

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Control connection timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
