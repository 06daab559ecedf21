//! Append-only channels over a ledger provider.
//!
//! A channel is a forward-only chain of root addresses derived from a
//! seed. Anyone who knows the seed can rebuild the chain, which is what
//! lets a diagnostician audit an agent's log or every agent follow the
//! shared notification log.
//!
//! ```text
//!   seed ──► root_0 ──► root_1 ──► root_2 ──► ...
//!              │          │          │
//!           record_0   record_1   (next publish lands here)
//! ```
//!
//! # Retry policy
//!
//! A failed publish never advances the root. When a retry hits an
//! occupied address the stored payload is compared by content digest:
//! identical bytes mean the earlier attempt landed and the root moves on,
//! different bytes mean the chain has forked (`ProtocolViolation`).
//! Two exceptions move on to the next root instead:
//!
//! - the root holds a payload this writer started publishing but never
//!   saw confirmed (network error or cancelled future), which is kept;
//! - the writer was built with [`Writer::multi_writer`] and another
//!   identity got there first.

use crate::error::TraceError;
use crate::security::content_digest;
use ledgertrace_env::{Address, EnvError, LedgerProvider};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

const ROOT_DOMAIN: &[u8] = b"ledgertrace/root";
const NEXT_DOMAIN: &[u8] = b"ledgertrace/next";

/// Role component of a derived seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    Agent,
    Diagnostician,
    /// Authors of the shared notification log
    Notifier,
}

impl ChannelRole {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRole::Agent => "agent",
            ChannelRole::Diagnostician => "diagnostician",
            ChannelRole::Notifier => "notifier",
        }
    }
}

/// The string a channel's address chain is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seed(String);

impl Seed {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derives a seed from stable identifiers.
    ///
    /// Pure: any party that knows the namespace convention can rebuild
    /// the seed and therefore a matching `Reader`.
    pub fn derive(namespace: &str, role: ChannelRole, index: usize) -> Self {
        let label = format!("{}-{}{}", namespace, role.name(), index);
        Self(hex::encode(Sha256::digest(label.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        write!(f, "{}", short)
    }
}

/// First address of the chain for `seed`.
pub fn start_root(seed: &Seed) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(ROOT_DOMAIN);
    hasher.update(seed.as_str().as_bytes());
    Address::new(hex::encode(hasher.finalize()))
}

/// Address that follows `root` in the chain for `seed`.
pub fn next_root(seed: &Seed, root: &Address) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(NEXT_DOMAIN);
    hasher.update(seed.as_str().as_bytes());
    hasher.update(root.as_str().as_bytes());
    Address::new(hex::encode(hasher.finalize()))
}

/// Writing end of a channel.
///
/// Publishing takes `&mut self`: one Writer handles at most one
/// in-flight publish. Shared writers sit behind an async mutex.
pub struct Writer {
    provider: Arc<dyn LedgerProvider>,
    seed: Seed,
    start_root: Address,
    current_root: Address,
    published: u64,
    /// Digests of payloads in flight or with an unknown publish outcome
    unconfirmed: Vec<String>,
    /// Other identities append to the same chain
    multi_writer: bool,
}

impl Writer {
    pub fn new(provider: Arc<dyn LedgerProvider>, seed: Seed) -> Self {
        let start = start_root(&seed);
        Self {
            provider,
            seed,
            current_root: start.clone(),
            start_root: start,
            published: 0,
            unconfirmed: Vec::new(),
            multi_writer: false,
        }
    }

    /// Writer for a log other identities also append to.
    ///
    /// A root taken by a foreign record is skipped and the same payload
    /// is retried at the next root instead of raising `ProtocolViolation`.
    pub fn multi_writer(provider: Arc<dyn LedgerProvider>, seed: Seed) -> Self {
        Self {
            multi_writer: true,
            ..Self::new(provider, seed)
        }
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    pub fn start_root(&self) -> &Address {
        &self.start_root
    }

    /// Address the next publish will land on.
    pub fn current_root(&self) -> &Address {
        &self.current_root
    }

    /// Number of records this writer has placed on the chain.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Encodes and appends a record, returning the address it landed on.
    pub async fn publish<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<Address, TraceError> {
        let payload = serde_json::to_vec(record)?;
        self.publish_bytes(payload).await
    }

    /// Appends raw bytes at the current root and advances the chain.
    ///
    /// The payload's digest is remembered before the provider is called,
    /// so a dropped future leaves the writer in the same state as a
    /// network error.
    pub async fn publish_bytes(&mut self, payload: Vec<u8>) -> Result<Address, TraceError> {
        let digest = content_digest(&payload);
        self.mark_unconfirmed(&digest);

        loop {
            let target = self.current_root.clone();

            match self.provider.publish(&target, payload.clone()).await {
                Ok(confirmation) => {
                    debug!("Published {} bytes to {} (seed {})", confirmation.size, target, self.seed);
                }
                Err(EnvError::AddressOccupied(_)) => {
                    let stored = self.provider.fetch(&target).await?.map(|bytes| content_digest(&bytes));

                    match stored {
                        Some(d) if d == digest => {
                            debug!("Root {} already holds this record, treating as confirmed", target);
                        }
                        Some(d) if self.unconfirmed.contains(&d) => {
                            // An earlier attempt landed after all: keep it and move past it
                            debug!("Root {} holds an unconfirmed attempt, moving past it", target);
                            self.skip_to_next(&target, true);
                            self.mark_unconfirmed(&digest);
                            continue;
                        }
                        Some(_) if self.multi_writer => {
                            debug!(
                                "Root {} taken by another writer on {}, retrying at the next root",
                                target, self.seed
                            );
                            self.skip_to_next(&target, false);
                            self.mark_unconfirmed(&digest);
                            continue;
                        }
                        _ => {
                            return Err(TraceError::ProtocolViolation(format!(
                                "root {} of channel {} holds a different record",
                                target, self.seed
                            )));
                        }
                    }
                }
                Err(e) => return Err(TraceError::Network(e)),
            }

            self.skip_to_next(&target, true);
            return Ok(target);
        }
    }

    fn mark_unconfirmed(&mut self, digest: &str) {
        if !self.unconfirmed.iter().any(|d| d == digest) {
            self.unconfirmed.push(digest.to_string());
        }
    }

    fn skip_to_next(&mut self, root: &Address, ours: bool) {
        self.unconfirmed.clear();
        self.current_root = next_root(&self.seed, root);
        if ours {
            self.published += 1;
        }
    }

    /// Moves the current root forward past every occupied address.
    ///
    /// Needed when resuming a channel or before appending to a log that
    /// other identities also write to. Returns the number of roots skipped.
    pub async fn sync(&mut self) -> Result<u64, TraceError> {
        let mut skipped = 0;
        while self.provider.fetch(&self.current_root).await?.is_some() {
            self.current_root = next_root(&self.seed, &self.current_root);
            skipped += 1;
        }
        if skipped > 0 {
            debug!("Writer {} synced forward {} roots", self.seed, skipped);
        }
        Ok(skipped)
    }
}

/// Records decoded by one scan.
#[derive(Debug, Clone)]
pub struct ReadBatch<T> {
    /// Decoded records with the root each was found at, oldest first
    pub records: Vec<(Address, T)>,

    /// Roots whose payload could not be decoded as `T`
    pub undecodable: usize,
}

impl<T> ReadBatch<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops the addresses, keeping publish order.
    pub fn into_records(self) -> Vec<T> {
        self.records.into_iter().map(|(_, r)| r).collect()
    }
}

/// Reading end of a channel.
///
/// May be built from any seed, including one this process never wrote.
/// Keeps a private cursor so repeated `read_new` calls only return
/// records published since the previous call.
pub struct Reader {
    provider: Arc<dyn LedgerProvider>,
    seed: Seed,
    start_root: Address,
    cursor: Address,
}

impl Reader {
    pub fn new(provider: Arc<dyn LedgerProvider>, seed: Seed) -> Self {
        let start = start_root(&seed);
        Self {
            provider,
            seed,
            cursor: start.clone(),
            start_root: start,
        }
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    pub fn start_root(&self) -> &Address {
        &self.start_root
    }

    /// First root not yet returned by `read_new`.
    pub fn cursor(&self) -> &Address {
        &self.cursor
    }

    /// Reads the whole channel from its start root, oldest first.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<Vec<T>, TraceError> {
        let (batch, _) = self.scan(self.start_root.clone()).await?;
        Ok(batch.into_records())
    }

    /// Reads everything published since the last call and advances the cursor.
    ///
    /// The cursor only moves when the whole scan succeeds.
    pub async fn read_new<T: DeserializeOwned>(&mut self) -> Result<ReadBatch<T>, TraceError> {
        let (batch, end) = self.scan(self.cursor.clone()).await?;
        self.cursor = end;
        Ok(batch)
    }

    async fn scan<T: DeserializeOwned>(&self, from: Address) -> Result<(ReadBatch<T>, Address), TraceError> {
        let mut root = from;
        let mut records = Vec::new();
        let mut undecodable = 0;

        while let Some(bytes) = self.provider.fetch(&root).await? {
            match serde_json::from_slice::<T>(&bytes) {
                Ok(record) => records.push((root.clone(), record)),
                Err(e) => {
                    let err = TraceError::Decode {
                        address: root.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("Skipping record on channel {}: {}", self.seed, err);
                    undecodable += 1;
                }
            }
            root = next_root(&self.seed, &root);
        }

        Ok((ReadBatch { records, undecodable }, root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ledgertrace_env::{Confirmation, InMemoryLedger};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        n: u32,
    }

    fn ledger() -> Arc<dyn LedgerProvider> {
        InMemoryLedger::shared()
    }

    /// Commits the payload but reports a network failure the first `drops` times.
    struct LossyAck {
        inner: InMemoryLedger,
        drops: AtomicUsize,
    }

    #[async_trait]
    impl LedgerProvider for LossyAck {
        async fn publish(&self, address: &Address, payload: Vec<u8>) -> Result<Confirmation, EnvError> {
            let confirmation = self.inner.publish(address, payload).await?;
            if self.drops.load(Ordering::SeqCst) > 0 {
                self.drops.fetch_sub(1, Ordering::SeqCst);
                return Err(EnvError::network("ack lost"));
            }
            Ok(confirmation)
        }

        async fn fetch(&self, address: &Address) -> Result<Option<Vec<u8>>, EnvError> {
            self.inner.fetch(address).await
        }
    }

    /// Commits the payload, then stalls before acknowledging the first `stalls` times.
    struct SlowAck {
        inner: InMemoryLedger,
        stalls: AtomicUsize,
    }

    #[async_trait]
    impl LedgerProvider for SlowAck {
        async fn publish(&self, address: &Address, payload: Vec<u8>) -> Result<Confirmation, EnvError> {
            let confirmation = self.inner.publish(address, payload).await?;
            if self.stalls.load(Ordering::SeqCst) > 0 {
                self.stalls.fetch_sub(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
            Ok(confirmation)
        }

        async fn fetch(&self, address: &Address) -> Result<Option<Vec<u8>>, EnvError> {
            self.inner.fetch(address).await
        }
    }

    #[test]
    fn test_seed_derivation_is_pure() {
        let a = Seed::derive("sim0", ChannelRole::Agent, 3);
        let b = Seed::derive("sim0", ChannelRole::Agent, 3);
        assert_eq!(a, b);

        assert_ne!(a, Seed::derive("sim0", ChannelRole::Agent, 4));
        assert_ne!(a, Seed::derive("sim0", ChannelRole::Diagnostician, 3));
        assert_ne!(a, Seed::derive("sim1", ChannelRole::Agent, 3));
    }

    #[test]
    fn test_root_chain_moves_forward() {
        let seed = Seed::new("alpha");
        let r0 = start_root(&seed);
        let r1 = next_root(&seed, &r0);
        let r2 = next_root(&seed, &r1);

        assert_ne!(r0, r1);
        assert_ne!(r1, r2);
        assert_ne!(start_root(&Seed::new("beta")), r0);
    }

    #[tokio::test]
    async fn test_same_seed_same_roots() {
        let seed = Seed::derive("sim0", ChannelRole::Agent, 0);
        let mut w1 = Writer::new(ledger(), seed.clone());
        let mut w2 = Writer::new(ledger(), seed);

        for n in 0..5 {
            let a1 = w1.publish(&Note { n }).await.unwrap();
            let a2 = w2.publish(&Note { n: n + 100 }).await.unwrap();
            assert_eq!(a1, a2);
        }
        assert_eq!(w1.current_root(), w2.current_root());
    }

    #[tokio::test]
    async fn test_reader_returns_all_in_order() {
        let provider = ledger();
        let mut writer = Writer::new(provider.clone(), Seed::new("log"));
        for n in 0..4 {
            writer.publish(&Note { n }).await.unwrap();
        }

        let reader = Reader::new(provider, writer.seed().clone());
        let notes: Vec<Note> = reader.read().await.unwrap();

        assert_eq!(notes, (0..4).map(|n| Note { n }).collect::<Vec<_>>());
        assert_eq!(writer.published(), 4);
    }

    #[tokio::test]
    async fn test_empty_channel_reads_nothing() {
        let reader = Reader::new(ledger(), Seed::new("silent"));
        let notes: Vec<Note> = reader.read().await.unwrap();
        assert!(notes.is_empty());
    }

    #[tokio::test]
    async fn test_read_new_tracks_cursor() {
        let provider = ledger();
        let mut writer = Writer::new(provider.clone(), Seed::new("feed"));
        let mut reader = Reader::new(provider, Seed::new("feed"));

        writer.publish(&Note { n: 1 }).await.unwrap();
        writer.publish(&Note { n: 2 }).await.unwrap();
        let first = reader.read_new::<Note>().await.unwrap();
        assert_eq!(first.len(), 2);

        assert!(reader.read_new::<Note>().await.unwrap().is_empty());

        writer.publish(&Note { n: 3 }).await.unwrap();
        let second = reader.read_new::<Note>().await.unwrap().into_records();
        assert_eq!(second, vec![Note { n: 3 }]);
        assert_eq!(reader.cursor(), writer.current_root());
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let provider = ledger();
        let mut writer = Writer::new(provider.clone(), Seed::new("mixed"));
        writer.publish(&Note { n: 1 }).await.unwrap();
        writer.publish_bytes(b"{not json".to_vec()).await.unwrap();
        writer.publish(&Note { n: 3 }).await.unwrap();

        let mut reader = Reader::new(provider, Seed::new("mixed"));
        let batch = reader.read_new::<Note>().await.unwrap();

        assert_eq!(batch.undecodable, 1);
        assert_eq!(batch.into_records(), vec![Note { n: 1 }, Note { n: 3 }]);
    }

    #[tokio::test]
    async fn test_retry_after_lost_ack_is_deduplicated() {
        let provider = Arc::new(LossyAck {
            inner: InMemoryLedger::new(),
            drops: AtomicUsize::new(1),
        });
        let mut writer = Writer::new(provider.clone(), Seed::new("retry"));
        let root = writer.current_root().clone();

        let err = writer.publish(&Note { n: 7 }).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(writer.current_root(), &root);

        let landed = writer.publish(&Note { n: 7 }).await.unwrap();
        assert_eq!(landed, root);
        assert_eq!(provider.inner.len(), 1);

        let notes: Vec<Note> = Reader::new(provider, Seed::new("retry")).read().await.unwrap();
        assert_eq!(notes, vec![Note { n: 7 }]);
    }

    #[tokio::test]
    async fn test_abandoned_attempt_that_landed_is_kept() {
        let provider = Arc::new(LossyAck {
            inner: InMemoryLedger::new(),
            drops: AtomicUsize::new(1),
        });
        let mut writer = Writer::new(provider.clone(), Seed::new("abandon"));

        // Caller gives up on n=1 and moves on to a different record
        assert!(writer.publish(&Note { n: 1 }).await.is_err());
        let landed = writer.publish(&Note { n: 2 }).await.unwrap();

        assert_ne!(&landed, writer.start_root());
        assert_eq!(writer.published(), 2);

        let notes: Vec<Note> = Reader::new(provider, Seed::new("abandon")).read().await.unwrap();
        assert_eq!(notes, vec![Note { n: 1 }, Note { n: 2 }]);
    }

    #[tokio::test]
    async fn test_cancelled_publish_does_not_wedge_writer() {
        let provider = Arc::new(SlowAck {
            inner: InMemoryLedger::new(),
            stalls: AtomicUsize::new(1),
        });
        let mut writer = Writer::new(provider.clone(), Seed::new("cancel"));
        let first_root = writer.start_root().clone();

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(50), writer.publish(&Note { n: 1 })).await;
        assert!(cancelled.is_err());
        assert_eq!(writer.current_root(), &first_root);

        let landed = writer.publish(&Note { n: 2 }).await.unwrap();
        assert_eq!(landed, next_root(&Seed::new("cancel"), &first_root));

        let notes: Vec<Note> = Reader::new(provider, Seed::new("cancel")).read().await.unwrap();
        assert_eq!(notes, vec![Note { n: 1 }, Note { n: 2 }]);
    }

    #[tokio::test]
    async fn test_cancelled_publish_retried_is_deduplicated() {
        let provider = Arc::new(SlowAck {
            inner: InMemoryLedger::new(),
            stalls: AtomicUsize::new(1),
        });
        let mut writer = Writer::new(provider.clone(), Seed::new("cancel-retry"));

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(50), writer.publish(&Note { n: 1 })).await;
        assert!(cancelled.is_err());

        let landed = writer.publish(&Note { n: 1 }).await.unwrap();
        assert_eq!(&landed, writer.start_root());
        assert_eq!(provider.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_writers_racing_both_land() {
        let provider = ledger();
        let seed = Seed::new("notification");
        let mut a = Writer::multi_writer(provider.clone(), seed.clone());
        let mut b = Writer::multi_writer(provider.clone(), seed.clone());

        assert_eq!(a.sync().await.unwrap(), 0);
        assert_eq!(b.sync().await.unwrap(), 0);

        let at_a = a.publish(&Note { n: 1 }).await.unwrap();
        let at_b = b.publish(&Note { n: 2 }).await.unwrap();

        assert_eq!(at_a, start_root(&seed));
        assert_eq!(at_b, next_root(&seed, &at_a));
        assert_eq!(b.published(), 1);

        // A falls behind B's record and skips it on its next append
        let again = a.publish(&Note { n: 3 }).await.unwrap();
        assert_eq!(again, next_root(&seed, &at_b));

        let notes: Vec<Note> = Reader::new(provider, seed).read().await.unwrap();
        assert_eq!(notes, vec![Note { n: 1 }, Note { n: 2 }, Note { n: 3 }]);
    }

    #[tokio::test]
    async fn test_fork_is_protocol_violation() {
        let provider = ledger();
        let mut w1 = Writer::new(provider.clone(), Seed::new("shared"));
        let mut w2 = Writer::new(provider, Seed::new("shared"));

        w1.publish(&Note { n: 1 }).await.unwrap();
        let err = w2.publish(&Note { n: 2 }).await.unwrap_err();

        assert!(matches!(err, TraceError::ProtocolViolation(_)));
        assert!(err.is_fatal());
        assert_eq!(w2.published(), 0);
    }

    #[tokio::test]
    async fn test_sync_resumes_at_head() {
        let provider = ledger();
        let mut w1 = Writer::new(provider.clone(), Seed::new("resume"));
        w1.publish(&Note { n: 1 }).await.unwrap();
        w1.publish(&Note { n: 2 }).await.unwrap();

        let mut w2 = Writer::new(provider.clone(), Seed::new("resume"));
        assert_eq!(w2.sync().await.unwrap(), 2);
        assert_eq!(w2.current_root(), w1.current_root());

        w2.publish(&Note { n: 3 }).await.unwrap();
        let notes: Vec<Note> = Reader::new(provider, Seed::new("resume")).read().await.unwrap();
        assert_eq!(notes.len(), 3);
    }
}
