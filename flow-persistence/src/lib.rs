//! Durable storage for flow checkpoints.
//!
//! The pipeline talks to storage only through [`CheckpointStore`]. Every
//! write is a single conditional put keyed by flow id and guarded by the
//! checkpoint version, so a store never holds a partially applied event.
//!
//! # Implementing a store
//!
//! ```rust,ignore
//! use flow_persistence::{CheckpointStore, SaveResult, StoreError};
//! use async_trait::async_trait;
//!
//! pub struct PostgresStore { /* pool */ }
//!
//! #[async_trait]
//! impl CheckpointStore for PostgresStore {
//!     async fn save(&self, checkpoint: &Checkpoint, expected_version: u64) -> Result<SaveResult, StoreError> {
//!         // UPDATE checkpoints SET body = $1, version = $2 + 1
//!         //  WHERE flow_id = $3 AND version = $2 AND status NOT IN ('COMPLETED', 'FAILED')
//!     }
//!     // ...
//! }
//! ```

mod in_memory;
mod store;

pub use in_memory::InMemoryCheckpointStore;
pub use store::{CheckpointStore, SaveResult, StoreError};
