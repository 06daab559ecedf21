//! Ledger provider abstraction.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{Address, Confirmation};

/// Abstraction for an append-only public ledger.
///
/// # Implementations
///
/// - **Reference**: `InMemoryLedger` - a shared map, no faults
/// - **Simulation**: `SimLedger` - wraps the reference ledger with
///   configurable failures and dropped acknowledgements
///
/// # Write Flow
///
/// ```text
/// Writer                     Provider                    Reader
///   |                           |                          |
///   |-- publish(root, bytes) -->|                          |
///   |<-- Confirmation ----------|                          |
///   |                           |<-- fetch(root) ----------|
///   |                           |--- Some(bytes) --------->|
/// ```
#[async_trait]
pub trait LedgerProvider: Send + Sync + 'static {
    /// Stores a payload at the given address.
    ///
    /// # Returns
    /// * `Ok(Confirmation)` - Payload is durable
    /// * `Err(EnvError::AddressOccupied)` - Something is already stored there
    /// * `Err(EnvError::NetworkError)` - Unknown outcome; the write may or may
    ///   not have landed
    async fn publish(&self, address: &Address, payload: Vec<u8>) -> Result<Confirmation, EnvError>;

    /// Fetches the payload stored at an address.
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` - Payload found
    /// * `Ok(None)` - Nothing published there yet
    async fn fetch(&self, address: &Address) -> Result<Option<Vec<u8>>, EnvError>;
}
