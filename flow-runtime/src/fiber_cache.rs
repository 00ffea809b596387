//! Suspended fibers kept in memory between events.
//!
//! Resuming a cached fiber skips decoding its continuation. An entry is only
//! handed out for the exact checkpoint version it was parked at and for the
//! execution context that built it; anything else falls back to
//! [`FlowFiber::restore`](flow_core::FlowFiber::restore).

use crate::config::FlowConfig;
use flow_core::{ExecutionContext, FiberState, FlowFiber, FlowId, HoldingIdentity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    fiber: FlowFiber,
    version: u64,
    owner: HoldingIdentity,
    exec: Arc<ExecutionContext>,
    inserted: Instant,
}

/// Bounded cache of suspended fibers, keyed by flow.
///
/// Entries expire `ttl` after they were parked. When full, the oldest entry
/// makes room for the new one. A capacity of zero disables caching.
pub struct FiberCache {
    entries: Mutex<HashMap<FlowId, Entry>>,
    capacity: usize,
    ttl: Duration,
}

impl FiberCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    pub fn from_config(config: &FlowConfig) -> Self {
        Self::new(config.fiber_cache_size, config.fiber_cache_ttl())
    }

    /// A cache that never holds anything.
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Park `fiber`, committed at `version`, for its next event.
    ///
    /// Fibers that are not suspended are dropped.
    pub fn put(
        &self,
        version: u64,
        owner: HoldingIdentity,
        exec: Arc<ExecutionContext>,
        fiber: FlowFiber,
    ) {
        if self.capacity == 0 || fiber.state() != FiberState::Suspended {
            return;
        }
        let flow_id = fiber.flow_id();
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, e| now.duration_since(e.inserted) < self.ttl);
        if !entries.contains_key(&flow_id) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                tracing::debug!(flow_id = %oldest, "evicted cached fiber");
            }
        }
        entries.insert(
            flow_id,
            Entry {
                fiber,
                version,
                owner,
                exec,
                inserted: now,
            },
        );
    }

    /// Take the fiber of `flow_id` if it was parked at `version` by `exec`.
    ///
    /// The entry is removed either way; a miss means the caller restores.
    pub fn take(&self, flow_id: FlowId, version: u64, exec: &Arc<ExecutionContext>) -> Option<FlowFiber> {
        let entry = self.lock().remove(&flow_id)?;
        if entry.version != version
            || !Arc::ptr_eq(&entry.exec, exec)
            || entry.inserted.elapsed() >= self.ttl
        {
            tracing::debug!(flow_id = %flow_id, cached = entry.version, version, "stale cached fiber");
            return None;
        }
        Some(entry.fiber)
    }

    pub fn remove(&self, flow_id: FlowId) {
        self.lock().remove(&flow_id);
    }

    /// Carry the entry of `flow_id` over a commit that did not run the fiber.
    pub fn advance(&self, flow_id: FlowId, from: u64, to: u64) {
        let mut entries = self.lock();
        match entries.get_mut(&flow_id) {
            Some(entry) if entry.version == from => entry.version = to,
            Some(_) => {
                entries.remove(&flow_id);
            }
            None => {}
        }
    }

    /// Drop every fiber of `owner`; its execution environment is going away.
    pub fn evict_owner(&self, owner: &HoldingIdentity) {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| &e.owner != owner);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(owner = %owner, evicted, "evicted cached fibers");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FlowId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
