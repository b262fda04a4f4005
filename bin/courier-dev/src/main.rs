//! Courier Development Runner
//!
//! Runs one message pump per configured job over an in-memory source seeded
//! with demo `Order` / `Shipment` payloads (plus the occasional payload no
//! handler understands), and logs pump and circuit stats until Ctrl+C.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courier_common::{init_logging, CorrelationInfo, MessageContext, OPERATION_ID_PROPERTY};
use courier_config::CourierConfig;
use courier_queue::InMemoryMessageSource;
use courier_router::{HandlerRegistration, HandlerRegistry, MessageHandler, PumpManager};

const DEFAULT_CONFIG: &str = r#"
[logging]
level = "info"

[[pumps]]
job_id = "sales"
max_concurrent_receives = 4
recovery_period_ms = 5000
probe_interval_ms = 1000
"#;

/// Courier development runner
#[derive(Parser, Debug)]
#[command(name = "courier-dev")]
#[command(about = "Courier development runner - message pumps over an in-memory source")]
struct Args {
    /// Configuration file (TOML); a single `sales` pump when omitted
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Demo messages seeded per job
    #[arg(long, env = "COURIER_DEMO_MESSAGES", default_value = "20")]
    demo_messages: usize,

    /// Fail every Nth order to exercise the circuit breaker (0 = never)
    #[arg(long, env = "COURIER_FAIL_EVERY", default_value = "0")]
    fail_every: usize,

    /// Interval between stats log lines, in seconds
    #[arg(long, env = "COURIER_STATS_INTERVAL_SECS", default_value = "10")]
    stats_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct Order {
    order_id: String,
    amount: u32,
}

#[derive(Debug, Deserialize)]
struct Shipment {
    shipment_id: String,
    order_id: String,
}

struct OrderHandler {
    fail_every: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl MessageHandler<Order> for OrderHandler {
    async fn process(
        &self,
        message: Order,
        context: &MessageContext,
        correlation: &CorrelationInfo,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && seen % self.fail_every == 0 {
            anyhow::bail!("order backend unavailable (order {})", message.order_id);
        }

        info!(
            job_id = %context.job_id(),
            order_id = %message.order_id,
            amount = message.amount,
            operation_id = %correlation.operation_id(),
            "Order processed"
        );
        Ok(())
    }
}

struct ShipmentHandler;

#[async_trait]
impl MessageHandler<Shipment> for ShipmentHandler {
    async fn process(
        &self,
        message: Shipment,
        context: &MessageContext,
        _correlation: &CorrelationInfo,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        info!(
            job_id = %context.job_id(),
            shipment_id = %message.shipment_id,
            order_id = %message.order_id,
            "Shipment processed"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CourierConfig::load(path)?,
        None => CourierConfig::from_toml_str(DEFAULT_CONFIG)?,
    };
    init_logging(&config.logging)?;

    info!("Starting Courier development runner");
    if config.pumps.is_empty() {
        warn!("No pumps configured, nothing to consume");
    }

    let mut registry = HandlerRegistry::new();
    for pump in &config.pumps {
        registry.register(HandlerRegistration::<Order>::new(
            pump.job_id.clone(),
            OrderHandler {
                fail_every: args.fail_every,
                seen: AtomicUsize::new(0),
            },
        ))?;
        registry.register(HandlerRegistration::<Shipment>::new(pump.job_id.clone(), ShipmentHandler))?;
    }

    let manager = Arc::new(PumpManager::new(registry));
    for pump_config in config.pump_configs() {
        let source = Arc::new(InMemoryMessageSource::new(format!("memory-{}", pump_config.job_id)));
        seed(&source, &pump_config.job_id, args.demo_messages)?;
        manager.add_pump(pump_config, source)?;
    }

    manager.start_all().await?;
    info!(pumps = config.pumps.len(), "Courier started, press Ctrl+C to shutdown");

    let stats_token = CancellationToken::new();
    let stats_handle = {
        let manager = Arc::clone(&manager);
        let token = stats_token.clone();
        let period = Duration::from_secs(args.stats_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => log_stats(&manager),
                }
            }
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received, stopping pumps...");

    stats_token.cancel();
    let _ = stats_handle.await;
    manager.stop_all().await;
    log_stats(&manager);

    info!("Courier shutdown complete");
    Ok(())
}

/// Enqueue demo payloads: orders, shipments and every fifth one unroutable
fn seed(source: &InMemoryMessageSource, job_id: &str, count: usize) -> Result<()> {
    for i in 0..count {
        let body = match i % 5 {
            4 => serde_json::json!({ "invoice_id": format!("inv-{}", i) }),
            n if n % 2 == 0 => serde_json::json!({ "order_id": format!("ord-{}", i), "amount": 10 * (i as u32 + 1) }),
            _ => serde_json::json!({ "shipment_id": format!("shp-{}", i), "order_id": format!("ord-{}", i - 1) }),
        };
        let context = MessageContext::new(uuid::Uuid::new_v4().to_string(), job_id)?
            .with_property(OPERATION_ID_PROPERTY, uuid::Uuid::new_v4().to_string());
        source.push(serde_json::to_vec(&body)?, context);
    }
    info!(job_id = %job_id, count, "Seeded demo messages");
    Ok(())
}

fn log_stats(manager: &PumpManager) {
    for stats in manager.stats() {
        info!(
            job_id = %stats.job_id,
            state = %stats.state,
            circuit = %stats.circuit,
            received = stats.received,
            succeeded = stats.succeeded,
            unmatched = stats.unmatched,
            failed = stats.failed,
            in_flight = stats.in_flight,
            "Pump stats"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
