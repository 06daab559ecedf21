//! Simulation context implementing TraceContext for deterministic runs.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use ledgertrace_env::TraceContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by a virtual clock and seeded key derivation.
///
/// - Virtual time only moves when the world ticks or a retry backs off
/// - Every identity is derived from the master seed, so a run is
///   reproducible from `--seed` alone
#[derive(Clone)]
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (milliseconds since simulation start)
    virtual_time_ms: Arc<AtomicU64>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ms: Arc::new(AtomicU64::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1_583_020_800), // 2020-03-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        self.virtual_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn time_ms(&self) -> u64 {
        self.virtual_time_ms.load(Ordering::SeqCst)
    }

    /// Independent RNG stream for one subsystem (movement, faults, ...).
    pub fn rng_stream(&self, stream: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);
        rng
    }
}

#[async_trait]
impl TraceContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_millis(self.time_ms())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Backoff consumes virtual time only
        self.advance_time(duration);
    }

    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey {
        let combined_seed = self.seed.wrapping_mul(0x517cc1b727220a95) ^ seed_extension;
        let mut key_rng = ChaCha8Rng::seed_from_u64(combined_seed);
        SigningKey::generate(&mut key_rng)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
