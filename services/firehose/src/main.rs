//! Allocation Event Firehose
//!
//! Publishes orchestrator task events to a stream, a message broker or
//! stdout. Runs until SIGINT/SIGTERM; exits non-zero when leadership, the
//! checkpoint or the configured sink cannot be set up.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use firehose_service::consul::ConsulClient;
use firehose_service::nomad::NomadClient;
use firehose_service::{sink, Config, Firehose, FirehoseSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        nomad_addr = %config.nomad_addr,
        consul_addr = %config.consul_addr,
        lock_key = %config.lock_key,
        checkpoint_key = %config.checkpoint_key,
        sink = config.sink.kind(),
        "Starting allocation firehose"
    );

    let orchestrator = Arc::new(NomadClient::new(
        &config.nomad_addr,
        config.nomad_token.as_deref(),
        config.nomad_namespace.as_deref(),
    )?);
    let kv = Arc::new(
        ConsulClient::new(&config.consul_addr, config.consul_token.as_deref())
            .context("Failed to build KV client")?,
    );
    let backend = sink::connect(&config.sink)
        .await
        .with_context(|| format!("Failed to set up {} sink", config.sink.kind()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    let firehose = Firehose::new(
        FirehoseSettings::from_config(&config),
        kv,
        orchestrator,
        backend,
    );
    firehose.run(shutdown_rx).await?;

    info!("Allocation firehose stopped");
    Ok(())
}
