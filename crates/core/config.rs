//! Configuration types for the queue manager.

use std::time::Duration;

/// Configuration for the QueueManager.
///
/// Per-queue settings (concurrency, poll interval) belong to each worker; this
/// holds what is shared across queues.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval of the throughput logging loop.
    pub stats_interval: Duration,
    /// How often `stop` re-checks the in-flight count while draining.
    pub drain_poll_interval: Duration,
    /// Drain timeout used by `run` and `run_until`.
    pub shutdown_timeout: Duration,
    /// Free slots at or above which a tick claims in one batch.
    pub batch_threshold: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(60),
            drain_poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            batch_threshold: 3,
        }
    }
}

/// Builder for ManagerConfig.
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stats logging interval.
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    /// Set the drain poll interval.
    pub fn drain_poll_interval(mut self, interval: Duration) -> Self {
        self.config.drain_poll_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the batch claim threshold. Values below 1 are raised to 1.
    pub fn batch_threshold(mut self, threshold: usize) -> Self {
        self.config.batch_threshold = threshold.max(1);
        self
    }

    /// Build the ManagerConfig.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

impl ManagerConfig {
    /// Create a new builder.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.stats_interval, Duration::from_secs(60));
        assert_eq!(config.drain_poll_interval, Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_threshold, 3);
    }

    #[test]
    fn test_manager_config_builder_fluent_chain() {
        let config = ManagerConfig::builder()
            .stats_interval(Duration::from_secs(5))
            .drain_poll_interval(Duration::from_millis(10))
            .shutdown_timeout(Duration::from_secs(2))
            .batch_threshold(4)
            .build();

        assert_eq!(config.stats_interval, Duration::from_secs(5));
        assert_eq!(config.drain_poll_interval, Duration::from_millis(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.batch_threshold, 4);
    }

    #[test]
    fn test_batch_threshold_floor() {
        let config = ManagerConfig::builder().batch_threshold(0).build();
        assert_eq!(config.batch_threshold, 1);
    }
}
