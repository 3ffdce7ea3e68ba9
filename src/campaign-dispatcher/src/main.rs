//! Campaign Dispatcher: runs the due-work scheduler and the send worker
//! for outbound email campaigns.

mod demo;

use campaign_core::config::AppConfig;
use campaign_core::event_bus::{DispatchEvent, EventSink};
use campaign_core::templates::PlaceholderRenderer;
use campaign_delivery::LogTransport;
use campaign_dispatch::DispatchService;
use campaign_store::MemoryStore;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-dispatcher")]
#[command(about = "Outbound email campaign scheduler and send worker")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "CAMPAIGN_DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_DISPATCH__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between scheduler cycles (overrides config)
    #[arg(long)]
    scheduler_interval: Option<u64>,

    /// Seconds between worker cycles (overrides config)
    #[arg(long)]
    worker_interval: Option<u64>,

    /// Prometheus exporter port; enables the exporter
    #[arg(long, env = "CAMPAIGN_DISPATCH__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Run one scheduler and one worker cycle, then exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Load a demo domain, mailboxes, campaign and enrolled leads
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

/// Forwards dispatch events to the log.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: DispatchEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => debug!(event = %json, "Dispatch event"),
            Err(e) => warn!(error = %e, "Failed to serialize dispatch event"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_dispatcher=info,campaign_dispatch=info,campaign_delivery=info,campaign_store=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Dispatcher starting up");

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) if cli.config.is_none() => {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.scheduler_interval {
        config.scheduler.interval_secs = secs;
    }
    if let Some(secs) = cli.worker_interval {
        config.worker.interval_secs = secs;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        scheduler_interval_secs = config.scheduler.interval_secs,
        worker_interval_secs = config.worker.interval_secs,
        selection = ?config.delivery.selection,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!(addr = %addr, "Metrics exporter started"),
            Err(e) => error!(error = %e, "Failed to start metrics exporter"),
        }
    }

    let store = Arc::new(MemoryStore::new());
    if cli.seed_demo {
        let enrolled = demo::seed(&store, chrono::Utc::now()).await?;
        info!(enrollments = enrolled, "Demo data loaded");
    }

    let service = DispatchService::new(
        config,
        store,
        Arc::new(LogTransport),
        Arc::new(PlaceholderRenderer::new()),
        Arc::new(LogSink),
    );

    if cli.once {
        let report = service.run_once().await?;
        info!(
            jobs_created = report.schedule.jobs_created,
            completed = report.schedule.enrollments_completed,
            sent = report.work.sent,
            failed = report.work.failed,
            deferred = report.work.deferred,
            leases_released = report.recovery.leases_released,
            "Single cycle finished"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = service.spawn(shutdown_rx);

    info!("Campaign Dispatcher is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, finishing current cycles");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Dispatch loop panicked");
        }
    }

    info!("Campaign Dispatcher stopped");
    Ok(())
}
