//! Common error types for Multiview.

use thiserror::Error;

/// Result type alias using Multiview's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Multiview operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected signaling envelope
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Target unreachable or its delivery address is stale
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Malformed session description or ICE candidate
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The media transport rejected an operation
    #[error("transport error: {0}")]
    Transport(String),

    /// No eligible media source appeared within the discovery budget
    #[error("no media source found after {attempts} attempts")]
    DiscoveryExhausted { attempts: u32 },

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a delivery error from any displayable type.
    pub fn delivery(msg: impl std::fmt::Display) -> Self {
        Self::Delivery(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Delivery failures are the only class worth a recovery attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
