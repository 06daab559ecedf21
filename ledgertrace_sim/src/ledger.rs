//! Simulated ledger provider with fault injection.

use async_trait::async_trait;
use ledgertrace_env::{Address, Confirmation, EnvError, InMemoryLedger, LedgerProvider};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fault knobs and counters shared between a `SimLedger` and the scenario.
pub struct SimLedgerController {
    /// Probability a publish fails before reaching storage (0.0 - 1.0)
    publish_failure_rate: Mutex<f64>,

    /// Probability a fetch fails (0.0 - 1.0)
    fetch_failure_rate: Mutex<f64>,

    /// Probability a committed publish reports failure anyway
    drop_ack_rate: Mutex<f64>,

    /// Publishes still forced to fail
    fail_next: AtomicUsize,

    /// Seeded fault RNG
    rng: Mutex<ChaCha8Rng>,

    publishes: AtomicU64,
    committed: AtomicU64,
    failed_publishes: AtomicU64,
    dropped_acks: AtomicU64,
    fetches: AtomicU64,
    failed_fetches: AtomicU64,
}

/// Snapshot of the controller's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub publishes: u64,
    pub committed: u64,
    pub failed_publishes: u64,
    pub dropped_acks: u64,
    pub fetches: u64,
    pub failed_fetches: u64,
}

impl SimLedgerController {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self {
            publish_failure_rate: Mutex::new(0.0),
            fetch_failure_rate: Mutex::new(0.0),
            drop_ack_rate: Mutex::new(0.0),
            fail_next: AtomicUsize::new(0),
            rng: Mutex::new(rng),
            publishes: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            failed_publishes: AtomicU64::new(0),
            dropped_acks: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            failed_fetches: AtomicU64::new(0),
        }
    }

    pub fn set_publish_failure_rate(&self, rate: f64) {
        *self.publish_failure_rate.lock().unwrap_or_else(|e| e.into_inner()) = rate.clamp(0.0, 1.0);
    }

    pub fn set_fetch_failure_rate(&self, rate: f64) {
        *self.fetch_failure_rate.lock().unwrap_or_else(|e| e.into_inner()) = rate.clamp(0.0, 1.0);
    }

    /// Sets the rate of "commit then lose the acknowledgement" faults.
    pub fn set_drop_ack_rate(&self, rate: f64) {
        *self.drop_ack_rate.lock().unwrap_or_else(|e| e.into_inner()) = rate.clamp(0.0, 1.0);
    }

    /// Forces the next `n` publishes to fail without storing anything.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Clears every fault.
    pub fn heal(&self) {
        self.set_publish_failure_rate(0.0);
        self.set_fetch_failure_rate(0.0);
        self.set_drop_ack_rate(0.0);
        self.fail_next(0);
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            publishes: self.publishes.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            failed_publishes: self.failed_publishes.load(Ordering::SeqCst),
            dropped_acks: self.dropped_acks.load(Ordering::SeqCst),
            fetches: self.fetches.load(Ordering::SeqCst),
            failed_fetches: self.failed_fetches.load(Ordering::SeqCst),
        }
    }

    fn roll(&self, rate: &Mutex<f64>) -> bool {
        let rate = *rate.lock().unwrap_or_else(|e| e.into_inner());
        if rate <= 0.0 {
            return false;
        }
        self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen::<f64>() < rate
    }

    fn take_forced_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Ledger provider wrapping an `InMemoryLedger` with seeded faults.
#[derive(Clone)]
pub struct SimLedger {
    storage: InMemoryLedger,
    controller: Arc<SimLedgerController>,
}

impl SimLedger {
    pub fn new(controller: Arc<SimLedgerController>) -> Self {
        Self {
            storage: InMemoryLedger::new(),
            controller,
        }
    }

    /// Fault-free view of the stored entries, for assertions.
    pub fn storage(&self) -> &InMemoryLedger {
        &self.storage
    }

    pub fn controller(&self) -> &Arc<SimLedgerController> {
        &self.controller
    }
}

#[async_trait]
impl LedgerProvider for SimLedger {
    async fn publish(&self, address: &Address, payload: Vec<u8>) -> Result<Confirmation, EnvError> {
        let c = &self.controller;
        c.publishes.fetch_add(1, Ordering::SeqCst);

        if c.take_forced_failure() || c.roll(&c.publish_failure_rate) {
            c.failed_publishes.fetch_add(1, Ordering::SeqCst);
            return Err(EnvError::network(format!("publish to {} dropped", address)));
        }

        let confirmation = self.storage.publish(address, payload).await?;
        c.committed.fetch_add(1, Ordering::SeqCst);

        if c.roll(&c.drop_ack_rate) {
            c.dropped_acks.fetch_add(1, Ordering::SeqCst);
            return Err(EnvError::Timeout(30_000));
        }
        Ok(confirmation)
    }

    async fn fetch(&self, address: &Address) -> Result<Option<Vec<u8>>, EnvError> {
        let c = &self.controller;
        c.fetches.fetch_add(1, Ordering::SeqCst);

        if c.roll(&c.fetch_failure_rate) {
            c.failed_fetches.fetch_add(1, Ordering::SeqCst);
            return Err(EnvError::network(format!("fetch of {} dropped", address)));
        }
        self.storage.fetch(address).await
    }
}
