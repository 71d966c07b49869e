//! Transaction manager configuration.

use serde::Deserialize;
use std::time::Duration;

/// Tunables of the transaction manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TxManagerConfig {
    /// Bound on waiting for the commit partition's primary replica to
    /// appear during the finish protocol.
    pub await_primary_replica_timeout: Duration,

    /// How long replicas may lag before their idle safe time catches up.
    /// Together with the clock skew bound this determines how far back safe
    /// read timestamps are taken.
    pub idle_safe_time_propagation: Duration,

    /// Initial delay between durable-finish retries.
    pub retry_backoff_base: Duration,

    /// Cap on the delay between durable-finish retries.
    pub retry_backoff_cap: Duration,
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            await_primary_replica_timeout: Duration::from_secs(10),
            idle_safe_time_propagation: Duration::from_secs(1),
            retry_backoff_base: Duration::from_millis(50),
            retry_backoff_cap: Duration::from_secs(5),
        }
    }
}
