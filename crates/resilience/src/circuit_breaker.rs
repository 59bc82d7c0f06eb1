//! Sliding-window circuit breaker.
//!
//! CLOSED tracks the last `window_size` outcomes and opens once at least
//! `minimum_samples` are present and the failure fraction reaches
//! `failure_threshold`. OPEN refuses everything until `recovery_timeout` has
//! elapsed; the first `can_execute` after that moves to HALF_OPEN and counts as
//! the first of `half_open_probe` admitted probes. One success closes the
//! breaker with a fresh window, one failure reopens it and restarts the timer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amas_core::config::CircuitConfig;
use amas_core::event_bus::{noop_sink, BreakerEvent, BreakerEventKind, BreakerEventSink, CircuitState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: f64,
    pub window_size: usize,
    pub recovery_timeout: Duration,
    pub half_open_probe: u32,
    pub minimum_samples: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitConfig::default())
    }
}

impl From<&CircuitConfig> for CircuitBreakerConfig {
    fn from(c: &CircuitConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            window_size: c.window_size.max(1),
            recovery_timeout: Duration::from_millis(c.recovery_timeout_ms),
            half_open_probe: c.half_open_probe.max(1),
            minimum_samples: c.minimum_samples.clamp(1, c.window_size.max(1)),
        }
    }
}

/// Point-in-time view for stats endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_rate: f64,
    pub window_len: usize,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_probes_used: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

struct Inner {
    state: CircuitState,
    /// `true` = success.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    half_open_probes_used: u32,
}

impl Inner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn push(&mut self, ok: bool, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.half_open_probes_used = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        self.opened_at = None;
        self.opened_at_wall = None;
        self.half_open_probes_used = 0;
    }
}

/// Breaker shared by every dispatcher that uses the same fast path.
///
/// All decisions happen under one lock; events are emitted after it is
/// released, so a slow sink never blocks callers and cannot reenter.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    sink: Arc<dyn BreakerEventSink>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_sink(name, config, noop_sink())
    }

    pub fn with_sink(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        sink: Arc<dyn BreakerEventSink>,
    ) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                opened_at_wall: None,
                half_open_probes_used: 0,
            }),
            config,
            sink,
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_rate(&self) -> f64 {
        self.inner.lock().failure_rate()
    }

    /// Whether the guarded path may be attempted now.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    /// [`can_execute`](Self::can_execute) against an explicit clock reading.
    pub fn can_execute_at(&self, now: Instant) -> bool {
        let mut events = Vec::new();
        let allowed = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map_or(true, |at| now.saturating_duration_since(at) >= self.config.recovery_timeout);
                    if elapsed {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_probes_used = 1;
                        info!(breaker = %self.name, "circuit breaker half-open, probing");
                        events.push(BreakerEventKind::StateChange {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            reason: "recovery timeout elapsed".into(),
                        });
                    }
                    elapsed
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_probes_used < self.config.half_open_probe {
                        inner.half_open_probes_used += 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        self.emit(events);
        allowed
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => inner.push(true, self.config.window_size),
                CircuitState::HalfOpen => {
                    inner.close();
                    info!(breaker = %self.name, "circuit breaker closed after recovery");
                    events.push(BreakerEventKind::StateChange {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                        reason: "probe succeeded".into(),
                    });
                    events.push(BreakerEventKind::Recovery);
                }
                // Late result from a call admitted before the breaker opened.
                CircuitState::Open => {}
            }
        }
        self.emit(events);
    }

    pub fn record_failure(&self, reason: &str) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.push(false, self.config.window_size);
                    let rate = inner.failure_rate();
                    events.push(BreakerEventKind::Failure {
                        reason: reason.to_string(),
                        failure_rate: rate,
                    });
                    if inner.window.len() >= self.config.minimum_samples
                        && rate >= self.config.failure_threshold
                    {
                        inner.open(now);
                        warn!(
                            breaker = %self.name,
                            failure_rate = rate,
                            reason,
                            "circuit breaker opened due to failures"
                        );
                        metrics::counter!("amas.breaker.opened").increment(1);
                        events.push(BreakerEventKind::StateChange {
                            from: CircuitState::Closed,
                            to: CircuitState::Open,
                            reason: reason.to_string(),
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    inner.open(now);
                    warn!(breaker = %self.name, reason, "circuit breaker re-opened from half-open");
                    metrics::counter!("amas.breaker.opened").increment(1);
                    events.push(BreakerEventKind::Failure {
                        reason: reason.to_string(),
                        failure_rate: inner.failure_rate(),
                    });
                    events.push(BreakerEventKind::StateChange {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                        reason: reason.to_string(),
                    });
                }
                CircuitState::Open => {}
            }
        }
        self.emit(events);
    }

    /// Open immediately, whatever the window says. The recovery timer starts
    /// now.
    pub fn force_open(&self, reason: &str) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.open(Instant::now());
            warn!(breaker = %self.name, reason, "circuit breaker forced open");
            if from != CircuitState::Open {
                metrics::counter!("amas.breaker.opened").increment(1);
            }
            events.push(BreakerEventKind::StateChange {
                from,
                to: CircuitState::Open,
                reason: format!("forced: {reason}"),
            });
        }
        self.emit(events);
    }

    /// Back to CLOSED with an empty window.
    pub fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.close();
            info!(breaker = %self.name, "circuit breaker reset");
            if from != CircuitState::Closed {
                events.push(BreakerEventKind::StateChange {
                    from,
                    to: CircuitState::Closed,
                    reason: "manual reset".into(),
                });
            }
        }
        self.emit(events);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_rate: inner.failure_rate(),
            window_len: inner.window.len(),
            opened_at: inner.opened_at_wall,
            half_open_probes_used: inner.half_open_probes_used,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, events: Vec<BreakerEventKind>) {
        for kind in events {
            self.sink.emit(BreakerEvent::new(self.name.clone(), kind));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use amas_core::event_bus::capture_sink;

    fn config(recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 0.5,
            window_size: 4,
            recovery_timeout: Duration::from_millis(recovery_ms),
            half_open_probe: 2,
            minimum_samples: 2,
        }
    }

    #[test]
    fn test_config_from_engine_config() {
        let c = CircuitBreakerConfig::default();
        assert_eq!(c.failure_threshold, 0.5);
        assert_eq!(c.window_size, 20);
        assert_eq!(c.recovery_timeout, Duration::from_secs(30));
        assert_eq!(c.half_open_probe, 2);
        assert_eq!(c.minimum_samples, 5);
    }

    #[test]
    fn test_stays_closed_below_minimum_samples() {
        let cb = CircuitBreaker::new("accel", config(30_000));
        cb.record_failure("boom");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_rate(), 1.0);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new("accel", config(30_000));
        cb.record_success();
        cb.record_success();
        cb.record_failure("a");
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure("b");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_window_slides() {
        let cb = CircuitBreaker::new("accel", config(30_000));
        cb.record_failure("a");
        for _ in 0..4 {
            cb.record_success();
        }
        // The early failure has been pushed out.
        assert_eq!(cb.failure_rate(), 0.0);
        assert_eq!(cb.snapshot().window_len, 4);
    }

    #[test]
    fn test_half_open_admits_exactly_probe_count() {
        let cb = CircuitBreaker::new("accel", config(30_000));
        cb.force_open("test");
        let later = Instant::now() + Duration::from_secs(31);

        assert!(!cb.can_execute());
        assert!(cb.can_execute_at(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute_at(later));
        assert!(!cb.can_execute_at(later));
        assert!(!cb.can_execute_at(later));
    }

    #[test]
    fn test_probe_success_closes_with_fresh_window() {
        let sink = capture_sink();
        let cb = CircuitBreaker::with_sink("accel", config(0), sink.clone());
        cb.record_failure("a");
        cb.record_failure("b");
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_rate(), 0.0);
        assert_eq!(cb.snapshot().window_len, 0);

        assert_eq!(
            sink.transitions(),
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
        assert_eq!(sink.recoveries(), 1);
    }

    #[test]
    fn test_probe_failure_reopens_and_restarts_timer() {
        let cb = CircuitBreaker::new("accel", config(30_000));
        cb.force_open("test");
        assert!(cb.can_execute_at(Instant::now() + Duration::from_secs(31)));
        cb.record_failure("still broken");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert!(cb.can_execute_at(Instant::now() + Duration::from_secs(31)));
    }

    #[test]
    fn test_force_open_and_reset() {
        let sink = capture_sink();
        let cb = CircuitBreaker::with_sink("accel", config(30_000), sink.clone());
        cb.force_open("maintenance");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.snapshot().opened_at.is_some());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert!(cb.snapshot().opened_at.is_none());
        assert_eq!(sink.transitions(), vec![CircuitState::Open, CircuitState::Closed]);

        // Resetting a closed breaker is silent.
        cb.reset();
        assert_eq!(sink.transitions().len(), 2);
    }

    #[test]
    fn test_failure_events_carry_rate() {
        let sink = capture_sink();
        let cb = CircuitBreaker::with_sink("accel", config(30_000), sink.clone());
        cb.record_success();
        cb.record_failure("timeout");
        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            BreakerEventKind::Failure { reason, failure_rate } => {
                assert_eq!(reason, "timeout");
                assert_eq!(*failure_rate, 0.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_counts_and_serializes() {
        let cb = CircuitBreaker::new("accel", config(30_000));
        cb.record_success();
        cb.record_failure("x");
        let snap = cb.snapshot();
        assert_eq!(snap.total_successes, 1);
        assert_eq!(snap.total_failures, 1);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["failureRate"], 0.5);
    }

    #[test]
    fn test_shared_across_threads() {
        let cb = Arc::new(CircuitBreaker::new("accel", config(30_000)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cb.record_success();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().total_successes, 400);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
