//! Audit trail of arbitration decisions.
//!
//! Provides the sink abstraction and a bounded in-memory implementation.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::now_ms;
use crate::util::serde::{RequestId, TaskId};

/// Audit event structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related task identifier.
    pub task_id: Option<TaskId>,
    /// Related request identifier.
    pub request_id: Option<RequestId>,
    /// Action taken (granted, rolled_back, canceled, error, released,
    /// dispatched, task_cancelled, recovered, orphan_resolved).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub payload: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);

    /// Events still retained by the sink, oldest first. Sinks that forward
    /// events elsewhere retain nothing.
    fn events(&self) -> Vec<AuditEvent> {
        Vec::new()
    }
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(4096)),
            max_events,
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

/// Shared handle to a sink, cloned into every component that audits.
pub type SharedAuditSink = Arc<Mutex<Box<dyn AuditSink>>>;

/// Wrap a sink for sharing.
pub fn shared_sink(sink: impl AuditSink + 'static) -> SharedAuditSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    task_id: Option<TaskId>,
    request_id: Option<RequestId>,
    action: impl Into<String>,
    payload: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        task_id,
        request_id,
        action: action.into(),
        created_at_ms: now_ms(),
        payload,
    }
}

/// Record into an optional shared sink.
pub(crate) fn record(
    audit: Option<&SharedAuditSink>,
    task_id: Option<TaskId>,
    request_id: Option<RequestId>,
    action: &str,
    payload: Option<String>,
) {
    if let Some(sink) = audit {
        sink.lock()
            .record(build_audit_event(task_id, request_id, action, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_audit_sink() {
        let mut sink = InMemoryAuditSink::new(10);
        let task = TaskId::new();
        sink.record(build_audit_event(Some(task), None, "granted", Some("furnace_1".into())));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id, Some(task));
        assert_eq!(events[0].action, "granted");
        assert!(events[0].created_at_ms > 0);
    }

    #[test]
    fn test_audit_sink_overflow() {
        let mut sink = InMemoryAuditSink::new(2);
        for action in ["granted", "released", "dispatched"] {
            sink.record(build_audit_event(None, None, action, None));
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "released");
        assert_eq!(events[1].action, "dispatched");
    }
}
