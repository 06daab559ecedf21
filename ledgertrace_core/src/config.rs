//! Protocol configuration.

use crate::security::PublicKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by every participant of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Namespace folded into every derived seed (e.g. "ledgertrace-sim0")
    pub namespace: String,

    /// Minimum simulation time between two periodic writes (default: 10s)
    pub min_write_interval_ms: u64,

    /// Publish retry policy
    pub retry: RetryPolicy,

    /// Notification authors to accept; empty accepts any verified author
    pub trusted_notifiers: Vec<PublicKey>,
}

impl TraceConfig {
    pub fn min_write_interval(&self) -> Duration {
        Duration::from_millis(self.min_write_interval_ms)
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            namespace: "ledgertrace-sim0".to_string(),
            min_write_interval_ms: 10_000,
            retry: RetryPolicy::default(),
            trusted_notifiers: Vec::new(),
        }
    }
}

/// Exponential backoff for retryable ledger failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 5)
    pub max_attempts: u32,

    /// Delay before the first retry (default: 200ms)
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay (default: 5s)
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TraceConfig::default();
        assert_eq!(config.min_write_interval(), Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.trusted_notifiers.is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TraceConfig = serde_json::from_str(r#"{"namespace": "city-7"}"#).unwrap();
        assert_eq!(config.namespace, "city-7");
        assert_eq!(config.min_write_interval_ms, 10_000);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
