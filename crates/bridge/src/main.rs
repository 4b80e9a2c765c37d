use anyhow::Context as _;
use clap::Parser as _;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use unrelated_api_bridge::config::BridgeConfig;
use unrelated_api_bridge::ops::Bridge;
use unrelated_api_bridge::{server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::parse();
    telemetry::init(config.log_format, config.telemetry_endpoint.as_deref())
        .context("install tracing subscriber")?;

    let bind = config.bind;
    let settings = config.into_settings();
    if settings.planner.is_none() {
        tracing::warn!("no planner configured; query requests will fail");
    }
    if settings.safety.allow_private_networks {
        tracing::warn!("outbound calls to private networks are allowed");
    }

    let bridge = Arc::new(Bridge::from_settings(settings).context("build bridge")?);
    let shutdown = CancellationToken::new();
    let sweeper = bridge.spawn_sweeper(shutdown.clone());

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    server::serve(listener, bridge, shutdown.clone())
        .await
        .context("serve")?;
    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}
