//! Engine configuration
//!
//! Worker pool sizing, loop timing, layer bounds, pause-state retries, and the
//! command channel backend.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::command::CommandChannelConfig;
use crate::error::EngineError;

/// Worker pool sizing and scaling thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Lower bound on live workers
    pub min_workers: usize,

    /// Upper bound on live workers
    pub max_workers: usize,

    /// Ready-queue depth above which a worker is added
    pub scale_up_threshold: usize,

    /// Idle time after which a worker may be removed
    #[serde(with = "humantime_serde")]
    pub scale_down_idle_time: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 3,
            scale_down_idle_time: Duration::from_secs(5),
        }
    }
}

/// Graph engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool policy
    pub worker_pool: WorkerPoolConfig,

    /// Longest single wait for worker events before the loop re-polls commands
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long an abort waits for in-flight nodes before dropping them
    #[serde(with = "humantime_serde")]
    pub abort_drain_timeout: Duration,

    /// Upper bound for a single layer callback
    #[serde(with = "humantime_serde")]
    pub layer_timeout: Duration,

    /// Maximum nesting of parallel groups accepted when building graphs
    pub max_parallel_depth: usize,

    /// Retry policy for writing pause-state blobs
    pub pause_storage_retry: RetryPolicy,

    /// Command channel backend
    pub command_channel: CommandChannelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::default(),
            poll_interval: Duration::from_millis(10),
            abort_drain_timeout: Duration::from_secs(10),
            layer_timeout: Duration::from_secs(5),
            max_parallel_depth: 3,
            pause_storage_retry: RetryPolicy::default(),
            command_channel: CommandChannelConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set worker bounds
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.worker_pool.min_workers = min;
        self.worker_pool.max_workers = max;
        self
    }

    /// Set the ready-queue depth that triggers scale-up
    pub fn with_scale_up_threshold(mut self, threshold: usize) -> Self {
        self.worker_pool.scale_up_threshold = threshold;
        self
    }

    /// Set the idle time that allows scale-down
    pub fn with_scale_down_idle_time(mut self, idle: Duration) -> Self {
        self.worker_pool.scale_down_idle_time = idle;
        self
    }

    /// Set the loop poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the abort drain timeout
    pub fn with_abort_drain_timeout(mut self, timeout: Duration) -> Self {
        self.abort_drain_timeout = timeout;
        self
    }

    /// Set the per-callback layer timeout
    pub fn with_layer_timeout(mut self, timeout: Duration) -> Self {
        self.layer_timeout = timeout;
        self
    }

    /// Set the maximum parallel nesting depth
    pub fn with_max_parallel_depth(mut self, depth: usize) -> Self {
        self.max_parallel_depth = depth;
        self
    }

    /// Set the pause-state storage retry policy
    pub fn with_pause_storage_retry(mut self, policy: RetryPolicy) -> Self {
        self.pause_storage_retry = policy;
        self
    }

    /// Set the command channel backend
    pub fn with_command_channel(mut self, channel: CommandChannelConfig) -> Self {
        self.command_channel = channel;
        self
    }

    /// Reject configurations the worker pool cannot honor
    pub fn validate(&self) -> Result<(), EngineError> {
        let pool = &self.worker_pool;
        if pool.min_workers == 0 {
            return Err(EngineError::config_error("min_workers must be at least 1"));
        }
        if pool.min_workers > pool.max_workers {
            return Err(EngineError::config_error(format!(
                "min_workers ({}) exceeds max_workers ({})",
                pool.min_workers, pool.max_workers
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(EngineError::config_error("poll_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Retry policy with exponential backoff
///
/// Used for node retries and for pause-state blob writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts
    pub max_retries: usize,

    /// Base delay for exponential backoff
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set backoff base duration
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set maximum backoff duration
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Delay before the given retry attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt as u32);
        let delay = self.backoff_base.saturating_mul(multiplier);
        delay.min(self.backoff_max)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_retries
    }

    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}
