//! Retry policy for forwarded calls

use std::time::Duration;

use crate::config::RetryConfig;

/// Constant-delay retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_retries: config.max_retries,
            delay: config.delay,
        }
    }

    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
