//! Common types for the LedgerTrace environment abstraction.

use serde::{Deserialize, Serialize};

/// Opaque ledger address (a channel root).
///
/// The protocol derives addresses from seeds but never interprets
/// their internal structure; providers treat them as map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates an address from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 12 chars for readability
        let short: String = self.0.chars().take(12).collect();
        write!(f, "{}", short)
    }
}

/// Receipt returned by a provider once a payload is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Address the payload was written to
    pub address: Address,

    /// Number of payload bytes stored
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_truncates() {
        let addr = Address::new("0123456789abcdef0123");
        assert_eq!(addr.to_string(), "0123456789ab");
        assert_eq!(addr.as_str(), "0123456789abcdef0123");
    }

    #[test]
    fn test_short_address_display() {
        assert_eq!(Address::new("abc").to_string(), "abc");
    }
}
