//! MessagePump - receive loop, worker pool and lifecycle of one job
//!
//! The loop is gated by the job's circuit:
//! - Closed: receive up to the free worker slots and route concurrently
//! - Open: no receive calls at all until the recovery period elapses
//! - HalfOpen: once nothing is in flight, receive one probe message per admitted window
//!
//! Routed messages run on a `TaskTracker` so `stop` can wait for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_common::{
    CircuitState, CorrelationInfo, ProcessingErrorKind, ProcessingResult, PumpConfig,
    PumpLifecycleState, UnmatchedPolicy,
};
use courier_queue::{MessageSource, ReceivedMessage};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreakerController, ProbeOutcome};
use crate::error::RouterError;
use crate::router::MessageRouter;
use crate::Result;

/// Property set on abandoned messages naming the failure kind
pub const FAILURE_PROPERTY: &str = "courier-failure";
/// Property set on abandoned messages carrying the handler error
pub const ERROR_PROPERTY: &str = "courier-error";

/// Counters and states of one pump
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub job_id: String,
    pub state: PumpLifecycleState,
    pub circuit: CircuitState,
    pub received: u64,
    pub succeeded: u64,
    pub unmatched: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

struct PumpInner {
    config: PumpConfig,
    source: Arc<dyn MessageSource>,
    router: MessageRouter,
    circuit: Arc<CircuitBreakerController>,
    lifecycle: watch::Sender<PumpLifecycleState>,
    in_flight: watch::Sender<usize>,
    received: AtomicU64,
    succeeded: AtomicU64,
    unmatched: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Handles of one Start..Stop run
struct PumpRun {
    receive_token: CancellationToken,
    processing_token: CancellationToken,
    tracker: TaskTracker,
    loop_handle: JoinHandle<()>,
}

/// What the receive loop and its workers share with the run
#[derive(Clone)]
struct LoopControl {
    receive_token: CancellationToken,
    processing_token: CancellationToken,
    tracker: TaskTracker,
}

/// Consumes one job's message source
pub struct MessagePump {
    inner: Arc<PumpInner>,
    run: tokio::sync::Mutex<Option<PumpRun>>,
}

impl MessagePump {
    pub fn new(
        config: PumpConfig,
        source: Arc<dyn MessageSource>,
        router: MessageRouter,
        circuit: Arc<CircuitBreakerController>,
    ) -> Result<Self> {
        config.validate()?;

        let (lifecycle, _) = watch::channel(PumpLifecycleState::Stopped);
        let (in_flight, _) = watch::channel(0usize);

        Ok(Self {
            inner: Arc::new(PumpInner {
                config,
                source,
                router,
                circuit,
                lifecycle,
                in_flight,
                received: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                unmatched: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            run: tokio::sync::Mutex::new(None),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.inner.config.job_id
    }

    pub fn config(&self) -> &PumpConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PumpLifecycleState {
        *self.inner.lifecycle.borrow()
    }

    /// Watch lifecycle transitions
    pub fn state_changes(&self) -> watch::Receiver<PumpLifecycleState> {
        self.inner.lifecycle.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    pub fn stats(&self) -> PumpStats {
        let inner = &self.inner;
        PumpStats {
            job_id: inner.config.job_id.clone(),
            state: self.state(),
            circuit: inner.circuit.get_state(&inner.config.job_id),
            received: inner.received.load(Ordering::Relaxed),
            succeeded: inner.succeeded.load(Ordering::Relaxed),
            unmatched: inner.unmatched.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            cancelled: inner.cancelled.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            last_error: inner.last_error.lock().clone(),
        }
    }

    /// Start the receive loop. Only valid while Stopped.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.run.lock().await;
        let state = self.state();
        if state != PumpLifecycleState::Stopped {
            return Err(RouterError::InvalidLifecycle {
                job_id: self.job_id().to_string(),
                operation: "start",
                state,
            });
        }

        // left behind by a loop that stopped itself on a fatal source error
        if let Some(stale) = slot.take() {
            self.inner.shutdown(stale).await;
        }

        self.inner.set_state(PumpLifecycleState::Starting);
        *self.inner.last_error.lock() = None;

        let control = LoopControl {
            receive_token: CancellationToken::new(),
            processing_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        self.inner.set_state(PumpLifecycleState::Running);
        let loop_handle = tokio::spawn(Arc::clone(&self.inner).run_loop(control.clone()));

        *slot = Some(PumpRun {
            receive_token: control.receive_token,
            processing_token: control.processing_token,
            tracker: control.tracker,
            loop_handle,
        });

        info!(
            job_id = %self.job_id(),
            source = %self.inner.source.identifier(),
            max_concurrent_receives = self.inner.config.max_concurrent_receives,
            "Message pump started"
        );
        Ok(())
    }

    /// Stop receiving, then wait for in-flight routes.
    ///
    /// Routes still running after the drain timeout are cancelled and
    /// their messages abandoned. Stopping a stopped pump is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.run.lock().await;
        let Some(run) = slot.take() else {
            return Ok(());
        };

        if self.state() != PumpLifecycleState::Stopped {
            self.inner.set_state(PumpLifecycleState::Stopping);
        }
        info!(job_id = %self.job_id(), in_flight = self.in_flight(), "Stopping message pump");

        self.inner.shutdown(run).await;

        let stats = self.stats();
        info!(
            job_id = %self.job_id(),
            received = stats.received,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Message pump stopped"
        );
        Ok(())
    }

    /// Stop, reconnect the source, start. Circuit state is kept.
    pub async fn restart(&self) -> Result<()> {
        info!(job_id = %self.job_id(), "Restarting message pump");
        self.stop().await?;
        self.inner.source.reconnect().await?;
        self.start().await
    }
}

/// Decrements the in-flight count when a worker finishes, even by panic
struct InFlightGuard(Arc<PumpInner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl PumpInner {
    fn job_id(&self) -> &str {
        &self.config.job_id
    }

    fn set_state(&self, to: PumpLifecycleState) {
        let from = self.lifecycle.send_replace(to);
        if from != to {
            debug!(job_id = %self.job_id(), from = %from, to = %to, "Pump state transition");
        }
    }

    /// Change between Running, Pausing and Paused; never leaves Stopping or Stopped
    fn set_active_state(&self, to: PumpLifecycleState) {
        let mut from = to;
        let changed = self.lifecycle.send_if_modified(|state| {
            if state.is_active() && *state != to {
                from = *state;
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(job_id = %self.job_id(), from = %from, to = %to, "Pump state transition");
        }
    }

    async fn shutdown(&self, run: PumpRun) {
        run.receive_token.cancel();
        if let Err(e) = run.loop_handle.await {
            error!(job_id = %self.job_id(), error = %e, "Receive loop terminated abnormally");
        }
        self.drain(&run.tracker, &run.processing_token).await;
        self.set_state(PumpLifecycleState::Stopped);
    }

    async fn drain(&self, tracker: &TaskTracker, processing_token: &CancellationToken) {
        tracker.close();
        if tokio::time::timeout(self.config.drain_timeout, tracker.wait()).await.is_err() {
            warn!(
                job_id = %self.job_id(),
                in_flight = *self.in_flight.borrow(),
                drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "Drain timeout elapsed, cancelling in-flight messages"
            );
            processing_token.cancel();
            tracker.wait().await;
        }
    }

    async fn run_loop(self: Arc<Self>, control: LoopControl) {
        let job_id = self.job_id().to_string();
        let concurrency = self.config.max_concurrent_receives as usize;
        let batch_size = (self.config.max_batch_size as usize).min(concurrency);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut circuit_rx = self.circuit.subscribe(&job_id);
        let mut in_flight_rx = self.in_flight.subscribe();
        let token = &control.receive_token;

        let mut fatal = false;

        debug!(job_id = %job_id, concurrency, batch_size, "Receive loop started");

        while !token.is_cancelled() {
            circuit_rx.borrow_and_update();
            in_flight_rx.borrow_and_update();

            match self.circuit.refresh(&job_id) {
                CircuitState::Closed => {
                    self.set_active_state(PumpLifecycleState::Running);

                    let first = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        permit = Arc::clone(&slots).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let mut permits = vec![first];
                    while permits.len() < batch_size {
                        match Arc::clone(&slots).try_acquire_owned() {
                            Ok(permit) => permits.push(permit),
                            Err(_) => break,
                        }
                    }

                    // the wait for a slot may have spanned a pause
                    if !self.circuit.get_state(&job_id).is_closed() {
                        continue;
                    }

                    match self.receive(permits.len(), token, &mut circuit_rx).await {
                        Ok(batch) if batch.is_empty() => {
                            drop(permits);
                            self.idle(self.config.empty_poll_delay, token).await;
                        }
                        Ok(batch) => {
                            if !self.circuit.get_state(&job_id).is_closed() {
                                self.release(batch).await;
                                continue;
                            }
                            for message in batch {
                                self.spawn_worker(&control, message, permits.pop(), false);
                            }
                        }
                        Err(e) => {
                            if self.receive_failed(e, token).await {
                                fatal = true;
                                break;
                            }
                        }
                    }
                }
                CircuitState::Open => {
                    let state = if *in_flight_rx.borrow() > 0 {
                        PumpLifecycleState::Pausing
                    } else {
                        PumpLifecycleState::Paused
                    };
                    self.set_active_state(state);
                    let half_open_at = self.circuit.next_transition_at(&job_id);
                    wait_for_change(token, &mut circuit_rx, &mut in_flight_rx, half_open_at).await;
                }
                CircuitState::HalfOpen => {
                    if *in_flight_rx.borrow() > 0 {
                        self.set_active_state(PumpLifecycleState::Pausing);
                        wait_for_change(token, &mut circuit_rx, &mut in_flight_rx, None).await;
                        continue;
                    }
                    self.set_active_state(PumpLifecycleState::Running);

                    if !self.circuit.try_admit_probe(&job_id) {
                        let next_probe_at = self.circuit.next_transition_at(&job_id);
                        wait_for_change(token, &mut circuit_rx, &mut in_flight_rx, next_probe_at).await;
                        continue;
                    }

                    match self.source.receive_batch(1, token).await {
                        Ok(mut batch) if !batch.is_empty() => {
                            let probe = batch.remove(0);
                            if !batch.is_empty() {
                                self.release(batch).await;
                            }
                            info!(job_id = %job_id, message_id = %probe.message_id(), "Routing probe message");
                            let handle = self.spawn_worker(&control, probe, None, true);
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => break,
                                _ = handle => {}
                            }
                        }
                        Ok(_) => {
                            self.circuit.complete_probe(&job_id, ProbeOutcome::Inconclusive);
                            self.idle(self.config.empty_poll_delay, token).await;
                        }
                        Err(e) => {
                            self.circuit.complete_probe(&job_id, ProbeOutcome::Inconclusive);
                            if self.receive_failed(e, token).await {
                                fatal = true;
                                break;
                            }
                        }
                    }
                }
            }
        }

        if fatal {
            self.drain(&control.tracker, &control.processing_token).await;
            self.set_state(PumpLifecycleState::Stopped);
        }

        debug!(job_id = %job_id, fatal, "Receive loop exited");
    }

    /// Receive while Closed; a circuit that opens meanwhile cuts the poll short
    async fn receive(
        &self,
        max_count: usize,
        token: &CancellationToken,
        circuit_rx: &mut watch::Receiver<CircuitState>,
    ) -> courier_queue::Result<Vec<ReceivedMessage>> {
        let poll_token = token.child_token();
        let receive = self.source.receive_batch(max_count, &poll_token);
        tokio::pin!(receive);

        loop {
            tokio::select! {
                biased;
                Ok(()) = circuit_rx.changed(), if !poll_token.is_cancelled() => {
                    if !circuit_rx.borrow_and_update().is_closed() {
                        poll_token.cancel();
                    }
                }
                result = &mut receive => return result,
            }
        }
    }

    /// Returns true when the error is fatal and the loop must exit
    async fn receive_failed(&self, e: courier_queue::QueueError, token: &CancellationToken) -> bool {
        if e.is_fatal() {
            error!(job_id = %self.job_id(), error = %e, "Message source failed, stopping pump");
            *self.last_error.lock() = Some(e.to_string());
            self.set_state(PumpLifecycleState::Stopping);
            return true;
        }

        warn!(
            job_id = %self.job_id(),
            error = %e,
            backoff_ms = self.config.receive_error_backoff.as_millis() as u64,
            "Receive failed, backing off"
        );
        *self.last_error.lock() = Some(e.to_string());
        self.idle(self.config.receive_error_backoff, token).await;
        false
    }

    async fn idle(&self, duration: std::time::Duration, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Hand received-but-unrouted messages back to the broker
    async fn release(&self, batch: Vec<ReceivedMessage>) {
        debug!(job_id = %self.job_id(), count = batch.len(), "Circuit not closed, releasing received messages");
        for message in batch {
            if let Err(e) = self.source.abandon(&message, HashMap::new()).await {
                warn!(job_id = %self.job_id(), message_id = %message.message_id(), error = %e, "Failed to release message");
            }
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        control: &LoopControl,
        message: ReceivedMessage,
        permit: Option<OwnedSemaphorePermit>,
        probe: bool,
    ) -> JoinHandle<()> {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.in_flight.send_modify(|n| *n += 1);
        let guard = InFlightGuard(Arc::clone(self));
        let inner = Arc::clone(self);
        let cancel = control.processing_token.clone();

        control.tracker.spawn(async move {
            let _guard = guard;
            let _permit = permit;
            inner.process(message, &cancel, probe).await;
        })
    }

    async fn process(&self, message: ReceivedMessage, cancel: &CancellationToken, probe: bool) {
        let job_id = self.job_id();
        let correlation = CorrelationInfo::from_context(&message.context);

        match self
            .router
            .route(&message.body, &message.context, &correlation, cancel)
            .await
        {
            Ok(result) if result.is_success() => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.record("succeeded");
                if probe {
                    self.circuit.complete_probe(job_id, ProbeOutcome::Succeeded);
                }
                if let Err(e) = self.source.acknowledge(&message).await {
                    warn!(job_id = %job_id, message_id = %message.message_id(), error = %e, "Failed to acknowledge message");
                }
            }
            Ok(result) if result.error_kind() == Some(ProcessingErrorKind::HandlerFailed) => {
                self.handler_failed(&message, &result, probe).await;
            }
            Ok(result) => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                self.record("unmatched");
                if probe {
                    self.circuit.complete_probe(job_id, ProbeOutcome::Inconclusive);
                }
                self.settle_unmatched(&message, &result).await;
            }
            Err(e) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                self.record("cancelled");
                if probe {
                    self.circuit.complete_probe(job_id, ProbeOutcome::Inconclusive);
                }
                debug!(job_id = %job_id, message_id = %message.message_id(), error = %e, "Route did not complete, abandoning");
                if let Err(e) = self.source.abandon(&message, HashMap::new()).await {
                    warn!(job_id = %job_id, message_id = %message.message_id(), error = %e, "Failed to abandon message");
                }
            }
        }
    }

    async fn handler_failed(&self, message: &ReceivedMessage, result: &ProcessingResult, probe: bool) {
        let job_id = self.job_id();
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record("handler_failed");

        let options = result.recovery().copied().unwrap_or(self.config.recovery);
        match self.circuit.pause(job_id, options) {
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to pause circuit"),
        }
        if probe {
            self.circuit.complete_probe(job_id, ProbeOutcome::Failed);
        }

        let error_message = result.error_message().unwrap_or("handler failed").to_string();
        error!(
            job_id = %job_id,
            message_id = %message.message_id(),
            message_type = result.handler().map(|h| h.message_type.as_str()).unwrap_or("unknown"),
            probe,
            error = %error_message,
            "Handler failed, circuit paused"
        );
        *self.last_error.lock() = Some(error_message.clone());

        let mut properties = HashMap::new();
        properties.insert(FAILURE_PROPERTY.to_string(), serde_json::json!(ProcessingErrorKind::HandlerFailed.as_str()));
        properties.insert(ERROR_PROPERTY.to_string(), serde_json::json!(error_message));
        if let Err(e) = self.source.abandon(message, properties).await {
            warn!(job_id = %job_id, message_id = %message.message_id(), error = %e, "Failed to abandon message");
        }
    }

    async fn settle_unmatched(&self, message: &ReceivedMessage, result: &ProcessingResult) {
        let job_id = self.job_id();
        let description = result.error_message().unwrap_or("no handler accepted the message");
        warn!(
            job_id = %job_id,
            message_id = %message.message_id(),
            policy = ?self.config.unmatched_policy,
            reason = %description,
            "Unmatched message"
        );

        let settled = match self.config.unmatched_policy {
            UnmatchedPolicy::DeadLetter => {
                self.source
                    .dead_letter(message, ProcessingErrorKind::Unmatched.as_str(), description)
                    .await
            }
            UnmatchedPolicy::Abandon => {
                let mut properties = HashMap::new();
                properties.insert(FAILURE_PROPERTY.to_string(), serde_json::json!(ProcessingErrorKind::Unmatched.as_str()));
                self.source.abandon(message, properties).await
            }
        };
        if let Err(e) = settled {
            warn!(job_id = %job_id, message_id = %message.message_id(), error = %e, "Failed to settle unmatched message");
        }
    }

    fn record(&self, outcome: &'static str) {
        metrics::counter!(
            "courier_messages_total",
            "job_id" => self.config.job_id.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Park the loop until the circuit changes, in-flight work changes, `deadline` passes or the run is cancelled
async fn wait_for_change(
    token: &CancellationToken,
    circuit_rx: &mut watch::Receiver<CircuitState>,
    in_flight_rx: &mut watch::Receiver<usize>,
    deadline: Option<Instant>,
) {
    let timer = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = token.cancelled() => {}
        _ = circuit_rx.changed() => {}
        _ = in_flight_rx.changed() => {}
        _ = timer => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MessageHandler;
    use crate::registry::{HandlerRegistration, HandlerRegistry};
    use async_trait::async_trait;
    use courier_common::{MessageContext, RecoveryOptions};
    use courier_queue::memory::InMemoryMessageSource;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Order {
        order_id: String,
    }

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler<Order> for Recording {
        async fn process(
            &self,
            message: Order,
            _context: &MessageContext,
            _correlation: &CorrelationInfo,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            self.seen.lock().push(message.order_id);
            Ok(())
        }
    }

    fn setup(
        handler: impl MessageHandler<Order>,
        config: PumpConfig,
    ) -> (MessagePump, Arc<InMemoryMessageSource>, Arc<CircuitBreakerController>) {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerRegistration::<Order>::new("orders", handler)).unwrap();
        let source = Arc::new(InMemoryMessageSource::with_long_poll("mem", Duration::from_millis(20)));
        let circuit = Arc::new(CircuitBreakerController::new());
        let pump = MessagePump::new(
            config,
            source.clone(),
            MessageRouter::new(Arc::new(registry)),
            circuit.clone(),
        )
        .unwrap();
        (pump, source, circuit)
    }

    fn order(id: &str) -> (String, MessageContext) {
        (
            format!(r#"{{"order_id":"{}"}}"#, id),
            MessageContext::new(format!("msg-{}", id), "orders").unwrap(),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (pump, _source, _circuit) = setup(Recording { seen }, PumpConfig::new("orders"));
        assert_eq!(pump.state(), PumpLifecycleState::Stopped);

        pump.start().await.unwrap();
        assert_eq!(pump.state(), PumpLifecycleState::Running);

        let err = pump.start().await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::InvalidLifecycle { operation: "start", state: PumpLifecycleState::Running, .. }
        ));

        pump.stop().await.unwrap();
        assert_eq!(pump.state(), PumpLifecycleState::Stopped);
        // second stop is a no-op
        pump.stop().await.unwrap();

        pump.start().await.unwrap();
        pump.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_routes_and_acknowledges() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (pump, source, _circuit) = setup(Recording { seen: seen.clone() }, PumpConfig::new("orders"));
        for id in ["1", "2", "3"] {
            let (body, ctx) = order(id);
            source.push(body, ctx);
        }

        pump.start().await.unwrap();
        eventually(|| source.completed().len() == 3).await;
        pump.stop().await.unwrap();

        let mut ids = seen.lock().clone();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3"]);
        let stats = pump.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_unmatched_policy() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (pump, source, _circuit) = setup(Recording { seen: seen.clone() }, PumpConfig::new("orders"));
        source.push("not json", MessageContext::new("msg-x", "orders").unwrap());

        pump.start().await.unwrap();
        eventually(|| source.dead_letters().len() == 1).await;
        pump.stop().await.unwrap();

        let dead = &source.dead_letters()[0];
        assert_eq!(dead.reason, "Unmatched");
        assert_eq!(dead.context.message_id(), "msg-x");
        assert!(seen.lock().is_empty());
        assert_eq!(pump.stats().unmatched, 1);

        let (pump, source, _circuit) = setup(
            Recording { seen },
            PumpConfig::new("orders").with_unmatched_policy(UnmatchedPolicy::Abandon),
        );
        source.push("not json", MessageContext::new("msg-y", "orders").unwrap());
        pump.start().await.unwrap();
        eventually(|| pump.stats().unmatched >= 1).await;
        pump.stop().await.unwrap();
        assert!(source.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_source_error_stops_pump() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (pump, source, _circuit) = setup(Recording { seen }, PumpConfig::new("orders"));
        source.disconnect();

        pump.start().await.unwrap();
        eventually(|| pump.state() == PumpLifecycleState::Stopped).await;
        assert!(pump.stats().last_error.unwrap().contains("disconnected"));

        // restart reconnects the source
        pump.restart().await.unwrap();
        assert_eq!(pump.state(), PumpLifecycleState::Running);
        assert_eq!(source.reconnect_count(), 1);
        pump.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_circuit_blocks_receive() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (pump, source, circuit) = setup(Recording { seen: seen.clone() }, PumpConfig::new("orders"));
        circuit
            .pause("orders", RecoveryOptions::new(Duration::from_secs(3600), Duration::from_secs(1)).unwrap())
            .unwrap();

        pump.start().await.unwrap();
        eventually(|| pump.state() == PumpLifecycleState::Paused).await;
        let calls = source.receive_calls();

        let (body, ctx) = order("1");
        source.push(body, ctx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.receive_calls(), calls);
        assert!(seen.lock().is_empty());

        // operator reset resumes consumption
        circuit.reset("orders");
        eventually(|| source.completed().len() == 1).await;
        assert_eq!(pump.state(), PumpLifecycleState::Running);
        pump.stop().await.unwrap();
    }
}
