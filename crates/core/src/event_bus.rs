//! Dispatch event bus: trait for publishing enrollment transitions and job
//! outcomes to the surrounding application (CRM notifications, dashboards).
//!
//! Components accept an `Arc<dyn EventSink>`. The binary logs events; tests
//! capture them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchEventType {
    JobQueued,
    JobDeferred,
    JobSent,
    JobFailed,
    JobRetriesExhausted,
    JobLeaseExpired,
    JobRequeued,
    EnrollmentAdvanced,
    EnrollmentCompleted,
    /// A step whose job exhausted its retries was passed over.
    StepSkipped,
    ConfigurationError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub event_id: Uuid,
    pub event_type: DispatchEventType,
    pub enrollment_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    /// Operator-facing detail such as a refusal reason or provider error.
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DispatchEvent);
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: DispatchEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DispatchEvent) {
        self.events.lock().push(event);
    }
}

/// Builder for `DispatchEvent` with the ids most events carry.
pub fn make_event(
    event_type: DispatchEventType,
    enrollment_id: Option<Uuid>,
    job_id: Option<Uuid>,
    campaign_id: Option<Uuid>,
) -> DispatchEvent {
    DispatchEvent {
        event_id: Uuid::new_v4(),
        event_type,
        enrollment_id,
        job_id,
        campaign_id,
        detail: None,
        timestamp: Utc::now(),
    }
}

impl DispatchEvent {
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let enrollment = Uuid::new_v4();
        sink.emit(make_event(DispatchEventType::JobQueued, Some(enrollment), None, None));
        sink.emit(
            make_event(DispatchEventType::JobDeferred, Some(enrollment), None, None)
                .with_detail("daily cap reached (5/5)"),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(DispatchEventType::JobDeferred), 1);
        assert_eq!(sink.count_type(DispatchEventType::JobSent), 0);
        let events = sink.events();
        assert_eq!(events[1].detail.as_deref(), Some("daily cap reached (5/5)"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = make_event(DispatchEventType::EnrollmentCompleted, None, None, None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("enrollment_completed"));
    }
}
