//! Per-job circuit breaker
//!
//! ```text
//! CLOSED ──pause──> OPEN ──recovery period──> HALF_OPEN ──probe succeeded──> CLOSED
//!                                                │   ▲
//!                                                └───┘ probe failed (next probe after interval)
//! ```
//!
//! The Open -> HalfOpen edge is time-driven. It is computed from `opened_at`
//! on every read, so `get_state` never needs a background timer; mutating
//! calls (and [`CircuitBreakerController::refresh`]) record it and publish it
//! to subscribers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_common::{CircuitState, CourierError, RecoveryOptions};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Result;

/// Result of processing a probe message while HalfOpen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Handler succeeded: close the circuit
    Succeeded,
    /// Handler failed: stay HalfOpen, next probe after `probe_interval`
    Failed,
    /// The probe told us nothing (unmatched, cancelled); the window is released
    Inconclusive,
}

/// Point-in-time view of one job's circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub job_id: String,
    pub state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
    pub recovery_period: Duration,
    pub probe_interval: Duration,
    pub times_opened: u64,
    pub probes_admitted: u64,
}

#[derive(Debug)]
struct CircuitInner {
    /// Last recorded state; may lag the effective state by the Open -> HalfOpen edge
    state: CircuitState,
    options: RecoveryOptions,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    /// Earliest instant the next probe may be admitted
    next_probe_at: Option<Instant>,
    times_opened: u64,
    probes_admitted: u64,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            options: RecoveryOptions::default(),
            opened_at: None,
            opened_at_utc: None,
            next_probe_at: None,
            times_opened: 0,
            probes_admitted: 0,
        }
    }

    fn half_open_at(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.options.recovery_period)
    }

    fn effective_state(&self, now: Instant) -> CircuitState {
        match (self.state, self.half_open_at()) {
            (CircuitState::Open, Some(at)) if now >= at => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }
}

struct JobCircuit {
    inner: Mutex<CircuitInner>,
    changes: watch::Sender<CircuitState>,
}

impl JobCircuit {
    fn new() -> Self {
        let (changes, _) = watch::channel(CircuitState::Closed);
        Self {
            inner: Mutex::new(CircuitInner::new()),
            changes,
        }
    }
}

/// Owns the circuit state of every job id.
///
/// All operations are safe to call concurrently from any number of workers;
/// each job's state is guarded by its own lock.
#[derive(Default)]
pub struct CircuitBreakerController {
    circuits: DashMap<String, Arc<JobCircuit>>,
}

impl CircuitBreakerController {
    pub fn new() -> Self {
        Self::default()
    }

    fn circuit(&self, job_id: &str) -> Option<Arc<JobCircuit>> {
        self.circuits.get(job_id).map(|c| Arc::clone(c.value()))
    }

    fn circuit_or_insert(&self, job_id: &str) -> Arc<JobCircuit> {
        if let Some(circuit) = self.circuit(job_id) {
            return circuit;
        }
        Arc::clone(
            self.circuits
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(JobCircuit::new()))
                .value(),
        )
    }

    /// Record the time-driven edge, if it is due
    fn materialize(job_id: &str, circuit: &JobCircuit, inner: &mut CircuitInner, now: Instant) {
        let effective = inner.effective_state(now);
        if effective != inner.state {
            Self::transition(job_id, circuit, inner, effective);
        }
    }

    fn transition(job_id: &str, circuit: &JobCircuit, inner: &mut CircuitInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => warn!(
                job_id = %job_id,
                from = %from,
                to = %to,
                recovery_period_ms = inner.options.recovery_period.as_millis() as u64,
                "Circuit opened, consumption paused"
            ),
            _ => info!(job_id = %job_id, from = %from, to = %to, "Circuit state transition"),
        }

        metrics::counter!(
            "courier_circuit_transitions_total",
            "job_id" => job_id.to_string(),
            "to" => to.to_string()
        )
        .increment(1);
        circuit.changes.send_replace(to);
    }

    /// Open the circuit for `job_id`.
    ///
    /// Only acts from Closed; returns `false` when the circuit was already
    /// Open or HalfOpen, leaving its opened-at timestamp untouched.
    pub fn pause(&self, job_id: &str, options: RecoveryOptions) -> Result<bool> {
        if job_id.trim().is_empty() {
            return Err(CourierError::InvalidArgument("job id must not be blank".to_string()).into());
        }
        options.validate()?;

        let circuit = self.circuit_or_insert(job_id);
        let mut inner = circuit.inner.lock();
        let now = Instant::now();
        Self::materialize(job_id, &circuit, &mut inner, now);

        if !inner.state.is_closed() {
            debug!(job_id = %job_id, state = %inner.state, "Pause ignored, circuit not closed");
            return Ok(false);
        }

        inner.options = options;
        inner.opened_at = Some(now);
        inner.opened_at_utc = Some(Utc::now());
        inner.next_probe_at = Some(now + options.recovery_period);
        inner.times_opened += 1;
        Self::transition(job_id, &circuit, &mut inner, CircuitState::Open);
        Ok(true)
    }

    /// Admit one probe while HalfOpen.
    ///
    /// Returns `true` at most once per probe interval window.
    pub fn try_admit_probe(&self, job_id: &str) -> bool {
        let Some(circuit) = self.circuit(job_id) else {
            return false;
        };
        let mut inner = circuit.inner.lock();
        let now = Instant::now();
        Self::materialize(job_id, &circuit, &mut inner, now);

        if !inner.state.is_half_open() {
            return false;
        }
        match inner.next_probe_at {
            Some(at) if now < at => false,
            _ => {
                inner.next_probe_at = Some(now + inner.options.probe_interval);
                inner.probes_admitted += 1;
                debug!(job_id = %job_id, probes_admitted = inner.probes_admitted, "Probe admitted");
                true
            }
        }
    }

    /// Report what the admitted probe produced
    pub fn complete_probe(&self, job_id: &str, outcome: ProbeOutcome) {
        let Some(circuit) = self.circuit(job_id) else {
            return;
        };
        let mut inner = circuit.inner.lock();
        let now = Instant::now();
        Self::materialize(job_id, &circuit, &mut inner, now);

        if !inner.state.is_half_open() {
            debug!(job_id = %job_id, state = %inner.state, ?outcome, "Probe outcome ignored");
            return;
        }

        match outcome {
            ProbeOutcome::Succeeded => {
                inner.opened_at = None;
                inner.opened_at_utc = None;
                inner.next_probe_at = None;
                Self::transition(job_id, &circuit, &mut inner, CircuitState::Closed);
            }
            ProbeOutcome::Failed => {
                let retry_at = now + inner.options.probe_interval;
                inner.next_probe_at = Some(inner.next_probe_at.map_or(retry_at, |at| at.max(retry_at)));
                warn!(
                    job_id = %job_id,
                    probe_interval_ms = inner.options.probe_interval.as_millis() as u64,
                    "Probe failed, circuit stays half-open"
                );
            }
            ProbeOutcome::Inconclusive => {
                inner.next_probe_at = Some(now);
                debug!(job_id = %job_id, "Probe inconclusive, window released");
            }
        }
    }

    /// Force the circuit closed. Returns `true` if it was not already closed.
    pub fn reset(&self, job_id: &str) -> bool {
        let Some(circuit) = self.circuit(job_id) else {
            return false;
        };
        let mut inner = circuit.inner.lock();
        if inner.state.is_closed() {
            return false;
        }
        inner.opened_at = None;
        inner.opened_at_utc = None;
        inner.next_probe_at = None;
        info!(job_id = %job_id, "Circuit reset by operator");
        Self::transition(job_id, &circuit, &mut inner, CircuitState::Closed);
        true
    }

    /// Current state; unknown jobs are Closed
    pub fn get_state(&self, job_id: &str) -> CircuitState {
        self.circuit(job_id)
            .map(|c| c.inner.lock().effective_state(Instant::now()))
            .unwrap_or(CircuitState::Closed)
    }

    /// Like [`get_state`](Self::get_state), but also records and publishes a due transition
    pub fn refresh(&self, job_id: &str) -> CircuitState {
        let Some(circuit) = self.circuit(job_id) else {
            return CircuitState::Closed;
        };
        let mut inner = circuit.inner.lock();
        Self::materialize(job_id, &circuit, &mut inner, Instant::now());
        inner.state
    }

    /// When the circuit next changes on its own or next admits a probe
    pub fn next_transition_at(&self, job_id: &str) -> Option<Instant> {
        let circuit = self.circuit(job_id)?;
        let inner = circuit.inner.lock();
        match inner.effective_state(Instant::now()) {
            CircuitState::Closed => None,
            CircuitState::Open => inner.half_open_at(),
            CircuitState::HalfOpen => inner.next_probe_at,
        }
    }

    /// Watch recorded state changes for `job_id`
    pub fn subscribe(&self, job_id: &str) -> watch::Receiver<CircuitState> {
        self.circuit_or_insert(job_id).changes.subscribe()
    }

    pub fn snapshot(&self, job_id: &str) -> CircuitSnapshot {
        match self.circuit(job_id) {
            Some(circuit) => Self::snapshot_of(job_id, &circuit.inner.lock()),
            None => Self::snapshot_of(job_id, &CircuitInner::new()),
        }
    }

    /// Snapshots of every known job, sorted by job id
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| Self::snapshot_of(entry.key(), &entry.value().inner.lock()))
            .collect();
        snapshots.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        snapshots
    }

    fn snapshot_of(job_id: &str, inner: &CircuitInner) -> CircuitSnapshot {
        CircuitSnapshot {
            job_id: job_id.to_string(),
            state: inner.effective_state(Instant::now()),
            opened_at: inner.opened_at_utc,
            recovery_period: inner.options.recovery_period,
            probe_interval: inner.options.probe_interval,
            times_opened: inner.times_opened,
            probes_admitted: inner.probes_admitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use tokio::time::advance;

    fn options(recovery_ms: u64, probe_ms: u64) -> RecoveryOptions {
        RecoveryOptions::new(Duration::from_millis(recovery_ms), Duration::from_millis(probe_ms)).unwrap()
    }

    #[test]
    fn test_unknown_job_is_closed() {
        let controller = CircuitBreakerController::new();
        assert_eq!(controller.get_state("orders"), CircuitState::Closed);
        assert!(!controller.try_admit_probe("orders"));
        assert!(controller.next_transition_at("orders").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_then_half_open_after_recovery_period() {
        let controller = CircuitBreakerController::new();
        assert!(controller.pause("orders", options(100, 50)).unwrap());
        assert_eq!(controller.get_state("orders"), CircuitState::Open);

        advance(Duration::from_millis(99)).await;
        assert_eq!(controller.get_state("orders"), CircuitState::Open);
        assert!(!controller.try_admit_probe("orders"));

        advance(Duration::from_millis(1)).await;
        assert_eq!(controller.get_state("orders"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_idempotent_while_open_or_half_open() {
        let controller = CircuitBreakerController::new();
        controller.pause("orders", options(100, 50)).unwrap();
        let first = controller.snapshot("orders");

        advance(Duration::from_millis(40)).await;
        assert!(!controller.pause("orders", options(500, 50)).unwrap());
        let second = controller.snapshot("orders");
        assert_eq!(second.state, CircuitState::Open);
        assert_eq!(second.opened_at, first.opened_at);
        assert_eq!(second.recovery_period, Duration::from_millis(100));
        assert_eq!(second.times_opened, 1);

        advance(Duration::from_millis(60)).await;
        assert!(!controller.pause("orders", options(100, 50)).unwrap());
        assert_eq!(controller.get_state("orders"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_admitted_once_per_interval() {
        let controller = CircuitBreakerController::new();
        controller.pause("orders", options(100, 50)).unwrap();
        advance(Duration::from_millis(100)).await;

        // 500ms in 5ms steps: admissions at 0, 50, 100, ... 450
        let mut admitted = 0;
        for _ in 0..100 {
            for _ in 0..10 {
                if controller.try_admit_probe("orders") {
                    admitted += 1;
                }
            }
            advance(Duration::from_millis(5)).await;
        }

        assert_eq!(admitted, 10);
        assert_eq!(controller.snapshot("orders").probes_admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_closes() {
        let controller = CircuitBreakerController::new();
        let mut changes = controller.subscribe("orders");
        controller.pause("orders", options(100, 50)).unwrap();
        assert_eq!(*changes.borrow_and_update(), CircuitState::Open);

        advance(Duration::from_millis(100)).await;
        assert!(controller.try_admit_probe("orders"));
        assert_eq!(*changes.borrow_and_update(), CircuitState::HalfOpen);

        controller.complete_probe("orders", ProbeOutcome::Succeeded);
        assert_eq!(controller.get_state("orders"), CircuitState::Closed);
        assert_eq!(*changes.borrow_and_update(), CircuitState::Closed);
        assert!(controller.snapshot("orders").opened_at.is_none());

        // closed again, so a new pause opens it
        assert!(controller.pause("orders", options(100, 50)).unwrap());
        assert_eq!(controller.snapshot("orders").times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_stays_half_open_and_waits_interval() {
        let controller = CircuitBreakerController::new();
        controller.pause("orders", options(100, 50)).unwrap();
        advance(Duration::from_millis(100)).await;
        assert!(controller.try_admit_probe("orders"));

        advance(Duration::from_millis(30)).await;
        controller.complete_probe("orders", ProbeOutcome::Failed);
        assert_eq!(controller.get_state("orders"), CircuitState::HalfOpen);

        // interval counted from the failure, not from the admission
        advance(Duration::from_millis(49)).await;
        assert!(!controller.try_admit_probe("orders"));
        advance(Duration::from_millis(1)).await;
        assert!(controller.try_admit_probe("orders"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconclusive_probe_releases_window() {
        let controller = CircuitBreakerController::new();
        controller.pause("orders", options(100, 50)).unwrap();
        advance(Duration::from_millis(100)).await;

        assert!(controller.try_admit_probe("orders"));
        assert!(!controller.try_admit_probe("orders"));
        controller.complete_probe("orders", ProbeOutcome::Inconclusive);
        assert!(controller.try_admit_probe("orders"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_transition_at() {
        let controller = CircuitBreakerController::new();
        let start = Instant::now();
        controller.pause("orders", options(100, 50)).unwrap();
        assert_eq!(controller.next_transition_at("orders"), Some(start + Duration::from_millis(100)));

        advance(Duration::from_millis(100)).await;
        assert!(controller.try_admit_probe("orders"));
        assert_eq!(controller.next_transition_at("orders"), Some(start + Duration::from_millis(150)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_snapshots() {
        let controller = CircuitBreakerController::new();
        controller.pause("shipments", options(100, 50)).unwrap();
        controller.pause("orders", options(100, 50)).unwrap();

        let snapshots = controller.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].job_id, "orders");
        assert_eq!(snapshots[1].state, CircuitState::Open);

        assert!(controller.reset("orders"));
        assert!(!controller.reset("orders"));
        assert_eq!(controller.get_state("orders"), CircuitState::Closed);
        assert_eq!(controller.get_state("shipments"), CircuitState::Open);
    }

    #[test]
    fn test_pause_rejects_blank_job_id() {
        let controller = CircuitBreakerController::new();
        let err = controller.pause(" ", RecoveryOptions::default()).unwrap_err();
        assert!(matches!(err, RouterError::Common(CourierError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_concurrent_pause_opens_once() {
        let controller = Arc::new(CircuitBreakerController::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller.pause("orders", RecoveryOptions::default()).unwrap()
            }));
        }

        let mut opened = 0;
        for handle in handles {
            if handle.await.unwrap() {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(controller.snapshot("orders").times_opened, 1);
    }
}
