/// Entry point for the logdock log streaming engine.
///
/// Streams stdout/stderr of every admitted container on this host to the
/// configured telemetry sink. Configuration comes entirely from
/// `LOGDOCK_*` environment variables; only the sink token is required.
///
/// # Examples
///
/// ```bash
/// LOGDOCK_TOKEN=secret LOGDOCK_SINK_URL=http://collector:4318/v1/logs cargo run
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(logdock::config::log_level()),
    )
    .init();
    logdock::run().await
}
