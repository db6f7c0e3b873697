//! Broker Gateway Binary
//!
//! Runs the gateway, ledger reconciliation and risk monitor against the
//! simulated brokerage.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin broker-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `BROKER_GATEWAY_CONFIG`: path to the YAML config (default: config.yaml,
//!   defaults are used when the file is absent)
//! - `RUST_LOG`: overrides the configured log level

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use broker_gateway::config::{Config, load_config_or_default};
use broker_gateway::gateway::Gateway;
use broker_gateway::infrastructure::PaperRemote;
use broker_gateway::ledger::Ledger;
use broker_gateway::monitor::RiskMonitor;
use broker_gateway::observability::{init_metrics, init_tracing};
use broker_gateway::resilience::{Clock, SystemClock};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Environment variable naming the config file.
const CONFIG_ENV: &str = "BROKER_GATEWAY_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var(CONFIG_ENV).ok();
    let config = load_config_or_default(config_path.as_deref())
        .context("failed to load configuration")?;

    init_tracing(&config.observability.logging).context("failed to initialise tracing")?;
    tracing::info!("Starting broker gateway");

    if init_metrics(&config.observability.metrics).context("failed to start metrics exporter")? {
        tracing::info!(
            listen_addr = %config.observability.metrics.listen_addr,
            "Prometheus exporter listening"
        );
    }

    let gateway = Arc::new(create_gateway(&config).await?);
    reconcile_on_startup(&config, &gateway).await?;

    let shutdown = CancellationToken::new();
    let sweeper = gateway.spawn_cache_sweeper(
        Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let monitor = Arc::new(RiskMonitor::new(
        Arc::clone(&gateway),
        config.monitor.clone(),
    ));
    if config.monitor.enabled {
        if let Err(e) = monitor.start() {
            tracing::warn!(error = %e, "Failed to start risk monitor, continuing without it");
        }
    } else {
        tracing::info!("Risk monitor disabled");
    }

    tracing::info!("Broker gateway ready");
    wait_for_signal().await;

    shutdown.cancel();
    monitor.stop().await;
    if tokio::time::timeout(config.monitor.shutdown_grace(), sweeper)
        .await
        .is_err()
    {
        tracing::warn!("Cache sweeper did not stop within grace period");
    }
    gateway.ledger().close().await;

    tracing::info!("Broker gateway stopped");
    Ok(())
}

/// Open the ledger and build the gateway over the simulated brokerage.
async fn create_gateway(config: &Config) -> anyhow::Result<Gateway> {
    let ledger = Ledger::from_settings(&config.ledger)
        .await
        .with_context(|| format!("failed to open ledger at {}", config.ledger.db_path))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let remote = Arc::new(PaperRemote::new());
    tracing::info!(
        db_path = %config.ledger.db_path,
        capacity = config.rate_limit.capacity,
        refill_per_second = config.rate_limit.refill_per_second,
        "Gateway initialized over paper brokerage"
    );
    Ok(Gateway::from_config(config, remote, ledger, clock))
}

/// Resolve PENDING records left by a previous run.
async fn reconcile_on_startup(config: &Config, gateway: &Gateway) -> anyhow::Result<()> {
    if !config.ledger.reconcile_on_startup {
        return Ok(());
    }
    let report = gateway
        .reconcile_pending()
        .await
        .context("startup reconciliation failed")?;
    if report.is_clean() {
        tracing::info!(
            examined = report.examined,
            succeeded = report.succeeded,
            failed = report.failed,
            "Startup reconciliation complete"
        );
    } else {
        tracing::error!(
            examined = report.examined,
            ambiguous = report.ambiguous.len(),
            "Startup reconciliation left ambiguous orders, operator action required"
        );
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}
