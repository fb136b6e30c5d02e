//! Configuration for the storage core
//!
//! Everything here is fixed at startup and shared read-only by every
//! component; nothing is read from ambient global state.

use crate::{Result, TsdbError, UidKind};
use rand::Rng;
use std::time::Duration;

/// Duration of one row bucket (one day)
pub const BUCKET_DURATION_MS: i64 = 86_400_000;

/// Timestamps above this value are milliseconds, otherwise seconds
pub const MILLISECOND_THRESHOLD: i64 = 10_000_000_000;

/// Width of the bucket field in a row key, in hex digits
pub const BUCKET_HEX_WIDTH: usize = 4;

/// Largest bucket number representable in the row key
pub const MAX_BUCKET: i64 = 0xffff;

/// Default uid width in bytes for every kind
pub const DEFAULT_UID_WIDTH: usize = 3;

/// Default namespace applied to every key
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default number of records requested per scan page
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 1000;

/// Storage core configuration
#[derive(Debug, Clone)]
pub struct TsdbConfig {
    /// Scope qualifier applied to every key read or written
    pub namespace: String,
    /// Metric uid width in bytes
    pub metric_width: usize,
    /// Tag key uid width in bytes
    pub tagk_width: usize,
    /// Tag value uid width in bytes
    pub tagv_width: usize,
    /// Bound and pacing for transaction retries
    pub retry: RetryPolicy,
    /// Page size requested from the store for range scans
    pub scan_page_size: usize,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            metric_width: DEFAULT_UID_WIDTH,
            tagk_width: DEFAULT_UID_WIDTH,
            tagv_width: DEFAULT_UID_WIDTH,
            retry: RetryPolicy::default(),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

impl TsdbConfig {
    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the uid width for one kind
    pub fn with_uid_width(mut self, kind: UidKind, width: usize) -> Self {
        match kind {
            UidKind::Metric => self.metric_width = width,
            UidKind::Tagk => self.tagk_width = width,
            UidKind::Tagv => self.tagv_width = width,
        }
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Uid width in bytes for a kind
    pub fn uid_width(&self, kind: UidKind) -> usize {
        match kind {
            UidKind::Metric => self.metric_width,
            UidKind::Tagk => self.tagk_width,
            UidKind::Tagv => self.tagv_width,
        }
    }

    /// Uid width in hex digits for a kind
    pub fn uid_hex_width(&self, kind: UidKind) -> usize {
        self.uid_width(kind) * 2
    }

    /// Check the configuration for values the codec cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(TsdbError::InvalidInput("namespace must not be empty".into()));
        }
        for kind in UidKind::ALL {
            let width = self.uid_width(kind);
            if !(1..=8).contains(&width) {
                return Err(TsdbError::InvalidInput(format!(
                    "{} uid width must be between 1 and 8 bytes, got {}",
                    kind, width
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(TsdbError::InvalidInput("retry.max_attempts must be at least 1".into()));
        }
        if self.scan_page_size == 0 {
            return Err(TsdbError::InvalidInput("scan_page_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Retry policy for conflicting or failed transactions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_interval: Duration,
    /// Backoff coefficient (multiplier for each retry)
    pub backoff_coefficient: f64,
    /// Upper bound on a single delay
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(5),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// No retries - fail on the first conflict
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set maximum attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay to wait after the given failed attempt (1-based), with jitter
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_coefficient
            .powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_interval.as_secs_f64() * exp;
        let capped = base.min(self.maximum_interval.as_secs_f64());
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(capped / 2.0..=capped);
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TsdbConfig::default();
        config.validate().unwrap();
        assert_eq!(config.uid_hex_width(UidKind::Metric), 6);
    }

    #[test]
    fn test_invalid_widths() {
        let config = TsdbConfig::default().with_uid_width(UidKind::Tagv, 0);
        assert!(config.validate().is_err());
        let config = TsdbConfig::default().with_uid_width(UidKind::Tagk, 9);
        assert!(config.validate().is_err());
        let config = TsdbConfig::default().with_namespace("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy::default();
        for attempt in 1..20 {
            assert!(policy.delay_after(attempt) <= policy.maximum_interval);
        }
        let first = policy.delay_after(1);
        assert!(first >= policy.initial_interval / 2);
    }
}
