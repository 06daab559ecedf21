//! Error taxonomy for the tracing protocol.

use ledgertrace_env::EnvError;
use thiserror::Error;

/// Errors raised by the protocol layer.
///
/// Only `ProtocolViolation`, `Identity` and `UnknownParticipant` abort a
/// participant's workflow. Authenticity and decode failures degrade
/// gracefully: the record is skipped and processing continues.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Malformed key material: {0}")]
    Identity(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Checksum verification failed for author {author}")]
    Verification { author: String },

    #[error("Ledger error: {0}")]
    Network(#[from] EnvError),

    #[error("Undecodable record at {address}: {reason}")]
    Decode { address: String, reason: String },

    #[error("Record encoding failed: {0}")]
    Encode(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unknown {role} index {index}")]
    UnknownParticipant { role: &'static str, index: usize },
}

impl TraceError {
    /// Whether the operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TraceError::Network(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the error must abort the participant's workflow.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TraceError::ProtocolViolation(_)
                | TraceError::Identity(_)
                | TraceError::UnknownParticipant { .. }
        )
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::Encode(e.to_string())
    }
}
