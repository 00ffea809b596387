//! In-memory implementation of [`CheckpointStore`].
//!
//! Checkpoints live in a `HashMap` behind a lock. Useful for tests and as
//! the reference for the conditional-write rules a real store must follow.

use crate::store::{CheckpointStore, SaveResult, StoreError};
use async_trait::async_trait;
use flow_core::{Checkpoint, FlowId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe in-memory checkpoint store. Clones share the same map.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<FlowId, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StoreError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|e| StoreError::Backend(format!("Lock error: {}", e)))?;
        Ok(checkpoints.get(&flow_id).cloned())
    }

    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<SaveResult, StoreError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|e| StoreError::Backend(format!("Lock error: {}", e)))?;

        let current = checkpoints.get(&checkpoint.flow_id);
        let current_version = current.map_or(0, |cp| cp.version);
        if current_version != expected_version || current.is_some_and(Checkpoint::is_terminal) {
            tracing::debug!(
                flow_id = %checkpoint.flow_id,
                expected_version,
                current_version,
                "rejecting stale checkpoint write"
            );
            return Ok(SaveResult::Conflict {
                current: current.map(|cp| cp.version),
            });
        }

        let version = expected_version + 1;
        let mut stored = checkpoint.clone();
        stored.version = version;
        checkpoints.insert(checkpoint.flow_id, stored);
        Ok(SaveResult::Saved { version })
    }

    async fn delete(&self, flow_id: FlowId) -> Result<(), StoreError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|e| StoreError::Backend(format!("Lock error: {}", e)))?;
        checkpoints.remove(&flow_id);
        Ok(())
    }

    async fn list_flow_ids(&self) -> Result<Vec<FlowId>, StoreError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|e| StoreError::Backend(format!("Lock error: {}", e)))?;
        Ok(checkpoints.keys().copied().collect())
    }
}
