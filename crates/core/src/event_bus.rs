//! Breaker event bus: trait for publishing circuit-breaker transitions.
//!
//! Breakers accept an `Arc<dyn BreakerEventSink>` and emit every transition,
//! failure and recovery into it. Sinks are observers only; nothing in the
//! breaker reads back from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; accelerated calls pass through.
    Closed,
    /// Failure rate too high; every call goes to the fallback.
    Open,
    /// Probing for recovery; a bounded number of calls allowed.
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakerEventKind {
    StateChange {
        from: CircuitState,
        to: CircuitState,
        reason: String,
    },
    Failure {
        reason: String,
        failure_rate: f64,
    },
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub event_id: Uuid,
    pub breaker: String,
    pub kind: BreakerEventKind,
    pub timestamp: DateTime<Utc>,
}

impl BreakerEvent {
    pub fn new(breaker: impl Into<String>, kind: BreakerEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            breaker: breaker.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

pub trait BreakerEventSink: Send + Sync {
    fn emit(&self, event: BreakerEvent);
}

/// No-op sink for breakers nobody observes.
pub struct NoOpSink;

impl BreakerEventSink for NoOpSink {
    fn emit(&self, _event: BreakerEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<BreakerEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<BreakerEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    /// Destination states of every recorded transition, in order.
    pub fn transitions(&self) -> Vec<CircuitState> {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter_map(|e| match e.kind {
                BreakerEventKind::StateChange { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn recoveries(&self) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.kind == BreakerEventKind::Recovery)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl BreakerEventSink for CaptureSink {
    fn emit(&self, event: BreakerEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience: a sink that drops everything.
pub fn noop_sink() -> Arc<dyn BreakerEventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
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

        sink.emit(BreakerEvent::new(
            "accel",
            BreakerEventKind::StateChange {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                reason: "failure rate".into(),
            },
        ));
        sink.emit(BreakerEvent::new("accel", BreakerEventKind::Recovery));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.transitions(), vec![CircuitState::Open]);
        assert_eq!(sink.recoveries(), 1);

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = BreakerEvent::new(
            "accel",
            BreakerEventKind::Failure {
                reason: "timeout".into(),
                failure_rate: 0.25,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["kind"], "failure");
        assert_eq!(json["breaker"], "accel");
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(BreakerEvent::new("accel", BreakerEventKind::Recovery));
    }
}
