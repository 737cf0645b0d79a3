//! Logdock: a single-host container log streaming engine.
//!
//! The engine discovers containers through the runtime's unix socket,
//! follows each container's stdout/stderr as a framed byte stream, and
//! forwards enriched records in batches to a telemetry sink. One stream
//! worker per container, one forwarder for the whole engine, and a
//! discovery loop keeping the two in sync with the runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use error::ResultOkLogExt;

pub mod config;
pub mod container;
pub mod demux;
pub mod discovery;
pub mod docker;
pub mod enrich;
pub mod error;
pub mod filter;
pub mod forward;
pub mod policy;
pub mod registry;
pub mod sink;
pub mod worker;

/// Runs the engine until SIGINT or SIGTERM, then drains and exits.
///
/// # Errors
///
/// Returns an error when the configuration is invalid (a missing sink
/// token, an unparseable setting, a malformed sink endpoint) or when the
/// signal handlers cannot be installed. Everything past startup is
/// handled by retry and backoff instead of propagation.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = config::Settings::from_env()?;

    let runtime: Arc<dyn docker::ContainerRuntime> =
        Arc::new(docker::DockerClient::new(&settings.docker_socket));
    let sink: Arc<dyn sink::LogSink> =
        Arc::new(sink::HttpSink::new(&settings.sink_url, &settings.token)?);

    let (forwarder, handle) = forward::Forwarder::new(sink, &settings);
    let metrics = handle.metrics();
    let forwarder_task = tokio::spawn(forwarder.run());

    let registry = Arc::new(registry::StreamRegistry::new());
    let discovery =
        discovery::DiscoveryLoop::new(runtime, Arc::clone(&registry), handle, &settings);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let discovery_task = tokio::spawn(discovery.run(shutdown_rx));

    log::info!(
        "logdock started, streaming to {} via {}",
        settings.sink_url,
        settings.docker_socket.display()
    );

    wait_for_termination().await?;
    log::info!("shutdown signal received, draining workers");

    let _ = shutdown_tx.send(true);
    registry.stop_all();

    // Workers deregister themselves once drained; give them the global
    // grace period before letting go of their records.
    let deadline = Instant::now() + settings.shutdown_grace;
    while !registry.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !registry.is_empty() {
        log::warn!(
            "{} stream workers still draining at the shutdown deadline",
            registry.len()
        );
    }

    discovery_task.await.ok_log();
    // The forwarder finishes its final flush once the last worker handle
    // is gone; a stuck sink must not hold the process open forever.
    match tokio::time::timeout(settings.shutdown_grace, forwarder_task).await {
        Ok(joined) => {
            joined.ok_log();
        }
        Err(_) => log::warn!("forwarder did not finish its final flush in time"),
    }

    log::info!(
        "logdock stopped: delivered={} dropped={}",
        metrics.delivered(),
        metrics.dropped()
    );
    Ok(())
}

async fn wait_for_termination() -> std::io::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
