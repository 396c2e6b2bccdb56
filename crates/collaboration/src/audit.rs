/// Audit trail hooks
/// Sinks are fire-and-forget: a failing sink never fails the collaboration flow
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{CollaborationError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub description: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl ToString,
        description: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            description: description.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.to_string(),
            metadata: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

pub trait AuditSink: Send + Sync {
    /// Must return promptly; never awaits the backing store
    fn log_event(&self, event: AuditEvent) -> Result<()>;
}

/// Hand an event to a sink, logging (not propagating) failures
pub fn record(sink: &dyn AuditSink, event: AuditEvent) {
    let event_type = event.event_type.clone();
    if let Err(e) = sink.log_event(event) {
        warn!(event_type, error = %e, "audit sink rejected event");
    }
}

/// Emits audit events on the `audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_event(&self, event: AuditEvent) -> Result<()> {
        info!(
            target: "audit",
            event_type = %event.event_type,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            metadata = %event.metadata,
            "{}",
            event.description
        );
        Ok(())
    }
}

/// Forwards events to a bounded channel drained by a persistence task
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn log_event(&self, event: AuditEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CollaborationError::StorageError("audit queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                CollaborationError::StorageError("audit sink closed".into())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_never_blocks() {
        let (sink, mut rx) = ChannelAuditSink::new(1);
        record(&sink, AuditEvent::new("comment_added", "comment", "c1", "first"));
        // queue full: dropped with a warning, no panic, no error to the caller
        record(&sink, AuditEvent::new("comment_added", "comment", "c2", "second"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.resource_id, "c1");
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(sink
            .log_event(AuditEvent::new("x", "y", "z", "closed"))
            .is_err());
    }
}
