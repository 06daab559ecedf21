//! In-memory reference ledger.

use crate::error::EnvError;
use crate::provider::LedgerProvider;
use crate::types::{Address, Confirmation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Ledger backed by a shared in-process map.
///
/// Cloning yields another handle onto the same storage, so a test can
/// hand one clone to the orchestrator and keep another for inspection.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    entries: Arc<RwLock<HashMap<Address, Vec<u8>>>>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped ledger for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of occupied addresses.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true when nothing has been published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the payload at an existing address.
    ///
    /// Real ledgers never allow this; it exists so tests and the harness
    /// can model tampering by a hostile storage node.
    pub fn tamper(&self, address: &Address, payload: Vec<u8>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(address) {
            Some(slot) => {
                *slot = payload;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LedgerProvider for InMemoryLedger {
    async fn publish(&self, address: &Address, payload: Vec<u8>) -> Result<Confirmation, EnvError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(address) {
            return Err(EnvError::occupied(address));
        }
        let size = payload.len();
        entries.insert(address.clone(), payload);
        Ok(Confirmation {
            address: address.clone(),
            size,
        })
    }

    async fn fetch(&self, address: &Address) -> Result<Option<Vec<u8>>, EnvError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let ledger = InMemoryLedger::new();
        let addr = Address::new("root-0");

        let confirmation = ledger.publish(&addr, b"hello".to_vec()).await.unwrap();
        assert_eq!(confirmation.size, 5);
        assert_eq!(ledger.fetch(&addr).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_never_overwrites() {
        let ledger = InMemoryLedger::new();
        let addr = Address::new("root-0");

        ledger.publish(&addr, b"first".to_vec()).await.unwrap();
        let err = ledger.publish(&addr, b"second".to_vec()).await.unwrap_err();

        assert!(matches!(err, EnvError::AddressOccupied(_)));
        assert_eq!(ledger.fetch(&addr).await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_missing_address_is_none() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.fetch(&Address::new("nowhere")).await.unwrap().is_none());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let ledger = InMemoryLedger::new();
        let other = ledger.clone();
        ledger.publish(&Address::new("a"), vec![1]).await.unwrap();

        assert_eq!(other.len(), 1);
        assert!(other.tamper(&Address::new("a"), vec![2]));
        assert_eq!(ledger.fetch(&Address::new("a")).await.unwrap(), Some(vec![2]));
        assert!(!other.tamper(&Address::new("b"), vec![3]));
    }
}
