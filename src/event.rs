//! Terminal events emitted once an execution completes or fails.
//!
//! Events are notifications, not state: the execution record is the source
//! of truth and is already committed by the time an event is built. Delivery
//! is at-least-once and a failed publish never touches the record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{ErrorDetail, ExchangeId, ExecutionRecord, WorkflowKind};

/// Default topic terminal events are appended to.
pub const DEFAULT_TOPIC: &str = "workflow_events";

/// A workflow finished, successfully or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub exchange_id: ExchangeId,
    pub kind: WorkflowKind,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Full record as committed, including the result payload.
    pub status: ExecutionRecord,
    pub error: Option<ErrorDetail>,
}

impl TerminalEvent {
    /// Build from a terminal record snapshot.
    pub fn from_record(record: ExecutionRecord) -> Self {
        Self {
            exchange_id: record.exchange_id,
            kind: record.kind,
            timestamp: Utc::now(),
            success: record.status == crate::model::Status::Completed,
            error: record.error.clone(),
            status: record,
        }
    }
}

/// Append-only sink for terminal events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &TerminalEvent) -> Result<()>;
}

/// Publishes to a pgmq queue named after the topic.
pub struct PgmqPublisher {
    db: Db,
    topic: String,
}

impl PgmqPublisher {
    /// Create the publisher, making sure the topic queue exists.
    pub async fn new(db: Db, topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        db.create_queue(&topic).await?;
        Ok(Self { db, topic })
    }
}

#[async_trait]
impl EventPublisher for PgmqPublisher {
    async fn publish(&self, event: &TerminalEvent) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        let msg_id = self
            .db
            .send_to_queue(&self.topic, &payload)
            .await
            .map_err(|e| Error::Publish(format!("topic {}: {e}", self.topic)))?;
        info!(
            exchange_id = %event.exchange_id,
            topic = %self.topic,
            msg_id,
            "terminal event published"
        );
        Ok(())
    }
}

/// Writes events to the log only. Used when no event log is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &TerminalEvent) -> Result<()> {
        info!(
            exchange_id = %event.exchange_id,
            kind = %event.kind,
            success = event.success,
            event = %serde_json::to_string(event)?,
            "terminal event"
        );
        Ok(())
    }
}
