//! Dispatch configuration.
//!
//! Defaults suit a single-node deployment; every knob can be overridden through
//! `HERALD_*` environment variables (see [`DispatchConfig::from_env`]).

use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Settings shared by the repository, the immediate dispatcher and the sweeper.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Time between sweeps
    pub sweep_interval: Duration,
    /// Maximum entries claimed per sweep
    pub batch_size: usize,
    /// Failed attempts after which an entry is dead
    pub max_retries: u32,
    /// Upper bound on one consumer invocation. A consumer that overruns it is
    /// abandoned, not stopped: its thread keeps running until the call returns
    /// and counts against `consumer_threads` meanwhile.
    pub event_timeout: Duration,
    /// Cap on consumer threads alive at once, abandoned ones included
    pub consumer_threads: usize,
    /// Upper bound on processing one claimed batch
    pub batch_deadline: Duration,
    /// How long a claimed entry stays leased to its sweeper
    pub lease_duration: Duration,
    /// Minimum entry age before the sweeper touches it, leaving the
    /// immediate path a head start
    pub grace_period: Duration,
    /// Total attempts for a business operation that hits a conflict
    pub conflict_attempts: u32,
    /// Base delay of the conflict backoff
    pub conflict_base_delay: Duration,
    /// Lease owner name of this sweeper instance
    pub sweeper_id: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            batch_size: 50,
            max_retries: 5,
            event_timeout: Duration::from_secs(5),
            consumer_threads: 64,
            batch_deadline: Duration::from_secs(20),
            lease_duration: Duration::from_secs(60),
            grace_period: Duration::from_secs(2),
            conflict_attempts: 3,
            conflict_base_delay: Duration::from_millis(100),
            sweeper_id: format!("sweeper-{}", Uuid::now_v7().simple()),
        }
    }
}

impl DispatchConfig {
    /// Read overrides from the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `HERALD_SWEEP_INTERVAL_MS` | 30000 |
    /// | `HERALD_SWEEP_BATCH_SIZE` | 50 |
    /// | `HERALD_MAX_RETRIES` | 5 |
    /// | `HERALD_EVENT_TIMEOUT_MS` | 5000 |
    /// | `HERALD_CONSUMER_THREADS` | 64 |
    /// | `HERALD_BATCH_DEADLINE_MS` | 20000 |
    /// | `HERALD_LEASE_MS` | 60000 |
    /// | `HERALD_GRACE_PERIOD_MS` | 2000 |
    /// | `HERALD_CONFLICT_RETRIES` | 3 |
    /// | `HERALD_CONFLICT_BASE_DELAY_MS` | 100 |
    /// | `HERALD_SWEEPER_ID` | `sweeper-<uuid>` |
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str, current: Duration| {
            parse_or(&lookup, key, current.as_millis() as u64).map(Duration::from_millis)
        };

        if let Some(v) = millis("HERALD_SWEEP_INTERVAL_MS", config.sweep_interval) {
            config.sweep_interval = v;
        }
        if let Some(v) = parse_or(&lookup, "HERALD_SWEEP_BATCH_SIZE", config.batch_size) {
            config.batch_size = v.max(1);
        }
        if let Some(v) = parse_or(&lookup, "HERALD_MAX_RETRIES", config.max_retries) {
            config.max_retries = v.max(1);
        }
        if let Some(v) = millis("HERALD_EVENT_TIMEOUT_MS", config.event_timeout) {
            config.event_timeout = v;
        }
        if let Some(v) = parse_or(&lookup, "HERALD_CONSUMER_THREADS", config.consumer_threads) {
            config.consumer_threads = v.max(1);
        }
        if let Some(v) = millis("HERALD_BATCH_DEADLINE_MS", config.batch_deadline) {
            config.batch_deadline = v;
        }
        if let Some(v) = millis("HERALD_LEASE_MS", config.lease_duration) {
            config.lease_duration = v;
        }
        if let Some(v) = millis("HERALD_GRACE_PERIOD_MS", config.grace_period) {
            config.grace_period = v;
        }
        if let Some(v) = parse_or(&lookup, "HERALD_CONFLICT_RETRIES", config.conflict_attempts) {
            config.conflict_attempts = v.max(1);
        }
        if let Some(v) = millis("HERALD_CONFLICT_BASE_DELAY_MS", config.conflict_base_delay) {
            config.conflict_base_delay = v;
        }
        if let Some(id) = lookup("HERALD_SWEEPER_ID").filter(|s| !s.trim().is_empty()) {
            config.sweeper_id = id.trim().to_string();
        }
        config
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    pub fn with_consumer_threads(mut self, limit: usize) -> Self {
        self.consumer_threads = limit.max(1);
        self
    }

    pub fn with_batch_deadline(mut self, deadline: Duration) -> Self {
        self.batch_deadline = deadline;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_conflict_attempts(mut self, attempts: u32) -> Self {
        self.conflict_attempts = attempts.max(1);
        self
    }

    pub fn with_conflict_base_delay(mut self, delay: Duration) -> Self {
        self.conflict_base_delay = delay;
        self
    }

    pub fn with_sweeper_id(mut self, id: impl Into<String>) -> Self {
        self.sweeper_id = id.into();
        self
    }

    /// Backoff used by [`Repository::execute`](crate::repository::Repository::execute).
    pub fn conflict_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.conflict_attempts,
            self.conflict_base_delay,
            self.conflict_base_delay * 16,
        )
    }

    /// Whether a lease outlives the longest a sweeper can hold a batch entry:
    /// the batch deadline plus one more consumer timeout for the entry that
    /// started just before it.
    pub fn lease_covers_batch(&self) -> bool {
        self.lease_duration > self.batch_deadline + self.event_timeout
    }
}

/// `Some(parsed)` when the variable is set and valid; `None` otherwise
/// (a warning is logged for invalid values).
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, default = %default, "invalid config value; using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = DispatchConfig::from_lookup(lookup(&[]));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.conflict_attempts, 3);
        assert!(config.sweeper_id.starts_with("sweeper-"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("HERALD_SWEEP_INTERVAL_MS", "250"),
            ("HERALD_MAX_RETRIES", "7"),
            ("HERALD_GRACE_PERIOD_MS", "0"),
            ("HERALD_SWEEPER_ID", "node-a"),
            ("HERALD_CONSUMER_THREADS", "8"),
        ]));
        assert_eq!(config.consumer_threads, 8);
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.grace_period, Duration::ZERO);
        assert_eq!(config.sweeper_id, "node-a");
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("HERALD_SWEEP_BATCH_SIZE", "lots"),
            ("HERALD_MAX_RETRIES", "0"),
        ]));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn conflict_settings_shape_the_repository_policy() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("HERALD_CONFLICT_RETRIES", "5"),
            ("HERALD_CONFLICT_BASE_DELAY_MS", "10"),
        ]));
        let policy = config.conflict_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(160));
    }

    #[test]
    fn lease_must_outlast_a_batch() {
        assert!(DispatchConfig::default().lease_covers_batch());
        let short = DispatchConfig::default()
            .with_batch_deadline(Duration::from_secs(20))
            .with_event_timeout(Duration::from_secs(5))
            .with_lease_duration(Duration::from_secs(25));
        assert!(!short.lease_covers_batch());
    }
}
