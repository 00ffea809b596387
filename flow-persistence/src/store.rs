//! The checkpoint store contract.

use async_trait::async_trait;
use flow_core::{Checkpoint, FlowId};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stored checkpoint could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The store could not be reached; the caller may try again later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Backend(String),
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    /// The checkpoint was stored under `version`.
    Saved { version: u64 },
    /// Another writer got there first. `current` is the stored version,
    /// or `None` if the flow has no checkpoint.
    Conflict { current: Option<u64> },
}

/// Keyed storage for checkpoints, one per flow.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint of a flow.
    ///
    /// Returns `Ok(None)` if the flow has never been committed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read.
    async fn load(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StoreError>;

    /// Store `checkpoint` if the stored version still equals `expected_version`.
    ///
    /// `expected_version` is the version the caller loaded, `0` for a flow
    /// that has no checkpoint yet. On success the stored copy carries
    /// `expected_version + 1`, which is returned. A terminal checkpoint is
    /// never overwritten; such writes report a conflict.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write could not be attempted. A lost race
    /// is not an error; it is reported as [`SaveResult::Conflict`].
    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<SaveResult, StoreError>;

    /// Remove the checkpoint of a flow. Removing a missing flow is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be written.
    async fn delete(&self, flow_id: FlowId) -> Result<(), StoreError>;

    /// List every flow id with a stored checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read.
    async fn list_flow_ids(&self) -> Result<Vec<FlowId>, StoreError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn load(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StoreError> {
        (**self).load(flow_id).await
    }

    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<SaveResult, StoreError> {
        (**self).save(checkpoint, expected_version).await
    }

    async fn delete(&self, flow_id: FlowId) -> Result<(), StoreError> {
        (**self).delete(flow_id).await
    }

    async fn list_flow_ids(&self) -> Result<Vec<FlowId>, StoreError> {
        (**self).list_flow_ids().await
    }
}
