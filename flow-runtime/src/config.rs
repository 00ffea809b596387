//! Engine configuration and its change notification channel.
//!
//! Components never reach into a shared mutable config. They are handed a
//! [`ConfigHandle`], read a snapshot with [`ConfigHandle::current`] when they
//! need one, and may [`subscribe`](ConfigHandle::subscribe) to react to
//! changes. A new snapshot applies to the next event processed; flows already
//! running finish with the snapshot they started with.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Backoff policy for retryable flow failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed before the flow is failed for good.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::milliseconds(capped as i64)
    }
}

/// Configuration for the flow pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Flows that may run at the same time.
    pub scheduler_pool_size: usize,
    pub retry: RetryPolicy,
    /// How long a flow may wait on session data before it is resumed with a
    /// timeout. `None` waits forever.
    pub suspension_timeout_ms: Option<u64>,
    /// How long a terminated flow's checkpoint is kept before cleanup.
    pub cleanup_delay_ms: u64,
    /// Suspended fibers kept in memory. Zero turns the cache off.
    pub fiber_cache_size: usize,
    pub fiber_cache_ttl_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            scheduler_pool_size: 8,
            retry: RetryPolicy::default(),
            suspension_timeout_ms: None,
            cleanup_delay_ms: 7 * 24 * 60 * 60 * 1_000,
            fiber_cache_size: 10,
            fiber_cache_ttl_ms: 5 * 60 * 1_000,
        }
    }
}

impl FlowConfig {
    /// Parse a configuration document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not a valid configuration document.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.scheduler_pool_size = size;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_suspension_timeout(mut self, timeout: Duration) -> Self {
        self.suspension_timeout_ms = Some(timeout.num_milliseconds().max(0) as u64);
        self
    }

    #[must_use]
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay_ms = delay.num_milliseconds().max(0) as u64;
        self
    }

    #[must_use]
    pub fn with_fiber_cache(mut self, size: usize, ttl: Duration) -> Self {
        self.fiber_cache_size = size;
        self.fiber_cache_ttl_ms = ttl.num_milliseconds().max(0) as u64;
        self
    }

    /// Pool size clamped to at least one worker.
    pub fn pool_size(&self) -> usize {
        self.scheduler_pool_size.max(1)
    }

    pub fn suspension_timeout(&self) -> Option<Duration> {
        self.suspension_timeout_ms
            .map(|ms| Duration::milliseconds(ms as i64))
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::milliseconds(self.cleanup_delay_ms as i64)
    }

    pub fn fiber_cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fiber_cache_ttl_ms)
    }
}

/// Owner of the configuration channel. Whoever loads configuration holds this.
pub struct ConfigSource {
    tx: watch::Sender<Arc<FlowConfig>>,
}

impl ConfigSource {
    pub fn new(config: FlowConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx }
    }

    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish a new configuration to every handle.
    pub fn update(&self, config: FlowConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Publish a modified copy of the current configuration.
    pub fn modify(&self, f: impl FnOnce(&mut FlowConfig)) {
        let mut next = FlowConfig::clone(&self.tx.borrow());
        f(&mut next);
        self.update(next);
    }
}

/// Read-only view of the current configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<Arc<FlowConfig>>,
}

impl ConfigHandle {
    /// A handle that never changes. Handy in tests and single-shot tools.
    pub fn fixed(config: FlowConfig) -> Self {
        ConfigSource::new(config).handle()
    }

    pub fn current(&self) -> Arc<FlowConfig> {
        Arc::clone(&self.rx.borrow())
    }

    /// A receiver that is notified on every update.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FlowConfig>> {
        self.rx.clone()
    }
}
