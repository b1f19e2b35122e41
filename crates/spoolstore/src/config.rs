//! Store configuration
//!
//! Queue capacity and the idle wait are the two throughput/latency levers of
//! the write pipeline; the engine section is passed through to the engine.

use std::time::Duration;

use spoolstore_engine::EngineConfig;

use crate::error::{StoreError, StoreResult};

/// Default pending queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 50_000;

/// Default upper bound of one idle wait of the worker
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of accepted-but-unapplied operations. Producers block
    /// once the queue holds this many.
    pub queue_capacity: usize,
    /// Longest the worker waits on an empty queue before re-checking for
    /// shutdown. New work wakes it immediately.
    pub poll_interval: Duration,
    /// Passed to the engine on open
    pub engine: EngineConfig,
}

impl StoreConfig {
    /// Small queue and short idle wait: bounded latency for the last write of
    /// a burst at the cost of more producer blocking.
    pub fn low_latency() -> Self {
        Self {
            queue_capacity: 1024,
            poll_interval: Duration::from_millis(10),
            engine: EngineConfig::default(),
        }
    }

    /// Default queue settings with an engine that fsyncs every applied write.
    pub fn durable() -> Self {
        Self {
            engine: EngineConfig::durable(),
            ..Self::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> StoreResult<()> {
        if self.queue_capacity == 0 {
            return Err(StoreError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(StoreError::InvalidConfig("poll_interval must be > 0".into()));
        }
        self.engine
            .validate()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.queue_capacity, 50_000);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_valid() {
        assert!(StoreConfig::low_latency().validate().is_ok());
        assert!(StoreConfig::durable().validate().is_ok());
        assert!(StoreConfig::durable().engine.sync_every_write);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = StoreConfig::default().with_queue_capacity(0);
        assert!(matches!(config.validate(), Err(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = StoreConfig::default().with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_section_validated() {
        let mut config = StoreConfig::default();
        config.engine.max_key_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_key_size"));
    }
}
