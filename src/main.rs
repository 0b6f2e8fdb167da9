//! JMA feed ingestion: binary entrypoint.
//! Loads configuration, wires the pipeline and runs the polling loop until Ctrl-C.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jma_feed_ingest::ingest::scheduler::{spawn_retention_task, spawn_scheduler};
use jma_feed_ingest::{
    GeoTables, IngestConfig, IngestPipeline, QuotaTracker, ReqwestTransport, Scheduler, Store,
};

/// Compact logs by default; `LOG_FORMAT=json` for structured output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("jma_feed_ingest=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

/// Expose Prometheus metrics when METRICS_ADDR is set (e.g. 0.0.0.0:9000).
fn init_metrics() -> Result<()> {
    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("METRICS_ADDR={addr:?} is not a socket address"))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("prometheus: install exporter")?;
        info!(%addr, "metrics exporter listening");
    }
    jma_feed_ingest::ingest::ensure_metrics_described();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = IngestConfig::load_default()?;
    init_metrics()?;
    info!(
        sources = cfg.sources.len(),
        base_interval_secs = cfg.base_interval_secs,
        daily_quota_bytes = cfg.daily_quota_bytes,
        "config loaded"
    );

    let geo = match &cfg.geo_tables_path {
        Some(p) => Arc::new(GeoTables::load_from(p)?),
        None => Arc::new(GeoTables::builtin().clone()),
    };
    let store = Store::open(&cfg.database_url).await?;
    let quota = Arc::new(match &cfg.quota_state_path {
        Some(p) => QuotaTracker::restore(p, cfg.daily_quota_bytes).await,
        None => QuotaTracker::new(cfg.daily_quota_bytes),
    });
    let transport = Arc::new(ReqwestTransport::new(
        Duration::from_secs(cfg.fetch_timeout_secs),
        &cfg.user_agent,
    )?);

    let pipeline = IngestPipeline::from_config(&cfg, store.clone(), transport, quota, geo);

    if let Some(days) = cfg.retention_days {
        spawn_retention_task(store.clone(), days);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = spawn_scheduler(Scheduler::new(pipeline, &cfg), stop_rx);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested, finishing current pass");
    let _ = stop_tx.send(true);
    handle.await.context("scheduler task")?;
    Ok(())
}
