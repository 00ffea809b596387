//! Outbound record publishing: the transport boundary of the pipeline.

use async_trait::async_trait;
use flow_core::OutboundRecord;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// Hands records produced by a committed event to the transport.
///
/// Called only after the checkpoint that produced `records` is durable.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Publish one event's records, in order.
    ///
    /// # Errors
    ///
    /// Returns `PublishError` if the transport does not accept the batch.
    async fn publish(&self, records: Vec<OutboundRecord>) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> RecordPublisher for Arc<P>
where
    P: RecordPublisher + ?Sized,
{
    async fn publish(&self, records: Vec<OutboundRecord>) -> Result<(), PublishError> {
        (**self).publish(records).await
    }
}

/// Collects published records in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    records: Arc<Mutex<Vec<OutboundRecord>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record published so far.
    pub fn records(&self) -> Vec<OutboundRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return every record published so far.
    pub fn take(&self) -> Vec<OutboundRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordPublisher for InMemoryPublisher {
    async fn publish(&self, records: Vec<OutboundRecord>) -> Result<(), PublishError> {
        self.records
            .lock()
            .map_err(|e| PublishError::Unavailable(format!("Lock error: {}", e)))?
            .extend(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flow_core::FlowId;

    #[tokio::test]
    async fn test_collects_in_order() {
        let publisher = InMemoryPublisher::new();
        let flow_id = FlowId::new();
        let first = OutboundRecord::ScheduleWakeup {
            flow_id,
            at: Utc::now(),
        };
        let second = OutboundRecord::SessionAck {
            flow_id,
            session_id: "s1".into(),
            sequence_number: 1,
        };
        publisher
            .publish(vec![first.clone(), second.clone()])
            .await
            .unwrap();
        assert_eq!(publisher.records(), vec![first.clone(), second.clone()]);
        assert_eq!(publisher.take(), vec![first, second]);
        assert!(publisher.is_empty());
    }
}
