//! Sync engine configuration
//!
//! All knobs default to the values the field deployments run with. The
//! backoff table is positional: entry `n` is the delay after failure
//! `n + 1`, and the last entry is reused for anything past the table.

use secrecy::SecretString;
use std::time::Duration;

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the reconciliation server
    pub server_url: String,
    /// Bearer token for the reconciliation endpoint
    pub auth_token: Option<SecretString>,
    /// Maximum number of changes submitted in one network call
    pub max_batch_size: usize,
    /// Attempts before an item is moved to the failed queue
    pub max_retries: u32,
    /// Backoff table indexed by attempt count
    pub retry_delays: Vec<Duration>,
    /// Interval of the periodic queue-depth check
    pub sync_check_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            auth_token: None,
            max_batch_size: 100,
            max_retries: 3,
            retry_delays: vec![
                Duration::from_millis(2_000),
                Duration::from_millis(5_000),
                Duration::from_millis(10_000),
            ],
            sync_check_interval: Duration::from_millis(30_000),
        }
    }
}

impl SyncConfig {
    /// Backoff delay for an item that has now failed `attempts` times.
    ///
    /// Attempt counts beyond the table reuse the last entry, so a
    /// mis-sized table never panics and never shortens the wait.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let last = self.retry_delays.len().saturating_sub(1);
        let idx = (attempts.saturating_sub(1) as usize).min(last);
        self.retry_delays
            .get(idx)
            .copied()
            .unwrap_or(Duration::from_secs(10))
    }
}
