//! Tea events server.
//!
//! Configuration comes from the TOML file named by `TEA_EVENTS_CONFIG`
//! (defaults otherwise). `TEA_LISTEN_ADDR` and `TEA_LEDGER_URL` override the
//! file.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use tea_events::adapters::{InMemoryStore, PrometheusMetrics, WsLedgerClient};
use tea_events::{EventPipeline, GatewayConfig, PipelineDeps};
use tea_telemetry::{init_telemetry, TelemetryConfig};

fn load_config() -> Result<GatewayConfig> {
    let mut config = match std::env::var("TEA_EVENTS_CONFIG") {
        Ok(path) => GatewayConfig::load(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => GatewayConfig::default(),
    };

    if let Ok(addr) = std::env::var("TEA_LISTEN_ADDR") {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("TEA_LISTEN_ADDR={addr}"))?;
        config.server.host = addr.ip();
        config.server.port = addr.port();
    }
    if let Ok(url) = std::env::var("TEA_LEDGER_URL") {
        config.ledger.url = url;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::from_env())?;

    let config = load_config()?;
    let addr = config.listen_addr();
    let deps = PipelineDeps::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(WsLedgerClient::new(config.ledger.url.clone())),
    )
    .with_metrics(Arc::new(PrometheusMetrics));

    let pipeline = EventPipeline::new(config, deps)?;
    let live = pipeline.start().await?;
    info!(version = tea_events::VERSION, live, "tea events starting");

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    pipeline
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
