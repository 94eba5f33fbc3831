//! Processor configuration

use std::time::Duration;

/// Exponential backoff on consecutive empty polls
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub enabled: bool,
    /// Consecutive empty polls before ticks start being skipped
    pub threshold: u32,
    /// Skip-budget growth factor per further empty poll
    pub multiplier: u32,
    /// Cap on the effective interval between non-skipped ticks
    pub max_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
            multiplier: 2,
            max_interval: Duration::from_secs(60),
        }
    }
}

/// Per-processor scheduling configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub polling_interval: Duration,
    pub batch_size: i64,
    pub enabled: bool,
    /// Consecutive handler errors before the processor flips to `failed`
    pub max_errors: u32,
    pub backoff: BackoffConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(500),
            batch_size: 100,
            enabled: true,
            max_errors: 10,
            backoff: BackoffConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::default();
        assert!(config.enabled);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.backoff.threshold, 3);
        assert_eq!(config.backoff.max_interval, Duration::from_secs(60));
    }
}
