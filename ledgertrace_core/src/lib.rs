//! LedgerTrace Core - Privacy-Preserving Contact Tracing over Public Ledgers
//!
//! Participants never talk to each other directly. Every message is a
//! record appended to a per-participant channel on an append-only ledger:
//! 1. **Channels**: deterministic root chains derived from a secret seed
//! 2. **Security**: Ed25519 authorship + X25519/XChaCha20-Poly1305 sealing
//! 3. **Protocol**: agent logs, diagnostician aggregates, notification log

pub mod channel;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod participant;
pub mod protocol;
pub mod security;

// Re-export key types for convenience
pub use channel::{start_root, ChannelRole, ReadBatch, Reader, Seed, Writer};
pub use config::{RetryPolicy, TraceConfig};
pub use error::TraceError;
pub use orchestrator::{AggregateReport, ChannelRegistry, Orchestrator};
pub use participant::{MedicalStatus, Participant, ParticipantState, Transition, WriteThrottle};
pub use protocol::{
    fold_notifications, AgentRecord, AggregateRecord, Authenticated, Checksum, NotificationRecord,
    NotificationScan, Sample, Snapshot,
};
pub use security::{Ciphertext, PublicKey, SecurityToolBox, Signature};
