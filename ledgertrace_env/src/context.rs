//! Core environment context trait for LedgerTrace participants.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so the orchestrator can run
/// both against a live ledger and inside the simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `OsRng`
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// Every method that would normally introduce non-determinism
/// (time, key generation) is controlled by the implementation.
#[async_trait]
pub trait TraceContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Drives the write throttle and every date recorded in a
    /// participant's medical status.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// Used for retry backoff after a ledger failure.
    /// In simulation: advances the virtual clock.
    async fn sleep(&self, duration: Duration);

    /// Generates an identity keypair from a seed extension.
    ///
    /// Production ignores the extension and draws from OS entropy.
    /// Simulation combines the master seed with `seed_extension` so
    /// that every participant identity is reproducible.
    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey;

    /// Returns the context's seed (0 when not seeded).
    fn seed(&self) -> u64;
}
