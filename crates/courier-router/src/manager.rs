//! PumpManager - owns the shared registry, the circuit controller and one pump per job

use std::sync::Arc;

use courier_common::PumpConfig;
use courier_queue::MessageSource;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::circuit_breaker::{CircuitBreakerController, CircuitSnapshot};
use crate::error::RouterError;
use crate::pump::{MessagePump, PumpStats};
use crate::registry::HandlerRegistry;
use crate::router::MessageRouter;
use crate::Result;

pub struct PumpManager {
    router: MessageRouter,
    circuit: Arc<CircuitBreakerController>,
    pumps: DashMap<String, Arc<MessagePump>>,
}

impl PumpManager {
    /// Freeze `registry` and share it across all pumps
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            router: MessageRouter::new(Arc::new(registry)),
            circuit: Arc::new(CircuitBreakerController::new()),
            pumps: DashMap::new(),
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn circuit(&self) -> &Arc<CircuitBreakerController> {
        &self.circuit
    }

    /// Create a pump for `config.job_id` reading from `source`
    pub fn add_pump(&self, config: PumpConfig, source: Arc<dyn MessageSource>) -> Result<Arc<MessagePump>> {
        let job_id = config.job_id.clone();
        if self.pumps.contains_key(&job_id) {
            return Err(RouterError::DuplicatePump(job_id));
        }

        if self.router.registry().candidates_for(&job_id).is_empty() {
            warn!(job_id = %job_id, "No handlers registered for job, every message will be unmatched");
        }

        let pump = Arc::new(MessagePump::new(
            config,
            source,
            self.router.clone(),
            Arc::clone(&self.circuit),
        )?);

        match self.pumps.entry(job_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RouterError::DuplicatePump(job_id)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&pump));
                info!(job_id = %job_id, "Pump added");
                Ok(pump)
            }
        }
    }

    pub fn pump(&self, job_id: &str) -> Option<Arc<MessagePump>> {
        self.pumps.get(job_id).map(|p| Arc::clone(p.value()))
    }

    fn all_pumps(&self) -> Vec<Arc<MessagePump>> {
        let mut pumps: Vec<_> = self.pumps.iter().map(|p| Arc::clone(p.value())).collect();
        pumps.sort_by(|a, b| a.job_id().cmp(b.job_id()));
        pumps
    }

    /// Start every stopped pump. Stops at the first failure.
    pub async fn start_all(&self) -> Result<()> {
        let pumps = self.all_pumps();
        info!(pumps = pumps.len(), "Starting all pumps");
        for pump in pumps {
            if pump.state().is_active() {
                continue;
            }
            pump.start().await?;
        }
        Ok(())
    }

    /// Stop all pumps concurrently and wait for every one to drain
    pub async fn stop_all(&self) {
        let pumps = self.all_pumps();
        info!(pumps = pumps.len(), "Stopping all pumps");

        let results = futures::future::join_all(pumps.iter().map(|pump| pump.stop())).await;
        for (pump, result) in pumps.iter().zip(results) {
            if let Err(e) = result {
                error!(job_id = %pump.job_id(), error = %e, "Failed to stop pump");
            }
        }
        info!("All pumps stopped");
    }

    pub async fn restart(&self, job_id: &str) -> Result<()> {
        let pump = self
            .pump(job_id)
            .ok_or_else(|| RouterError::UnknownJob(job_id.to_string()))?;
        pump.restart().await
    }

    /// Stats of every pump, sorted by job id
    pub fn stats(&self) -> Vec<PumpStats> {
        self.all_pumps().iter().map(|p| p.stats()).collect()
    }

    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.circuit.snapshots()
    }
}
