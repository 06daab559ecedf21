//! Error types for the LedgerTrace environment abstraction.

use thiserror::Error;

/// Errors that can occur while talking to the ledger.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// Provider unreachable or the request was dropped mid-flight
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The target address already holds a payload (ledgers never overwrite)
    #[error("Address already occupied: {0}")]
    AddressOccupied(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an occupied-address error.
    pub fn occupied(address: impl std::fmt::Display) -> Self {
        Self::AddressOccupied(address.to_string())
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::Timeout(_))
    }
}
