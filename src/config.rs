//! Startup configuration, read once from environment variables.
//!
//! The only required value is the sink token; everything else has a sane
//! default. Nothing here is reloadable at runtime.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing required environment variable `{0}`")]
    MissingToken(&'static str),
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

const TOKEN: &str = "LOGDOCK_TOKEN";
const SINK_URL: &str = "LOGDOCK_SINK_URL";
const SERVICE_NAME: &str = "LOGDOCK_SERVICE_NAME";
const DOCKER_SOCKET: &str = "LOGDOCK_DOCKER_SOCKET";
const EXCLUDE_CONTAINERS: &str = "LOGDOCK_EXCLUDE_CONTAINERS";
const INCLUDE_STOPPED: &str = "LOGDOCK_INCLUDE_STOPPED";
const LOG_LEVEL: &str = "LOGDOCK_LOG_LEVEL";
const BATCH_MAX_RECORDS: &str = "LOGDOCK_BATCH_MAX_RECORDS";
const BATCH_MAX_DELAY_MS: &str = "LOGDOCK_BATCH_MAX_DELAY_MS";
const QUEUE_CAPACITY: &str = "LOGDOCK_QUEUE_CAPACITY";
const PENDING_HARD_LIMIT: &str = "LOGDOCK_PENDING_HARD_LIMIT";
const SINK_RETRY_ATTEMPTS: &str = "LOGDOCK_SINK_RETRY_ATTEMPTS";
const STALL_TIMEOUT_SECS: &str = "LOGDOCK_STALL_TIMEOUT_SECS";

/// Immutable engine settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Sink credential; the one value without a default.
    pub token: String,
    /// Batch ingest endpoint of the telemetry sink.
    pub sink_url: String,
    /// The engine's own service name; always part of the exclude set.
    pub service_name: String,
    /// Path to the container runtime's unix socket.
    pub docker_socket: PathBuf,
    /// Container names never streamed.
    pub exclude_containers: Vec<String>,
    /// Also stream containers that are currently stopped.
    pub include_stopped: bool,
    /// Cut a batch once it holds this many records.
    pub batch_max_records: usize,
    /// Cut a non-empty batch after this long regardless of size.
    pub batch_max_delay: Duration,
    /// Forwarder channel capacity; the backpressure high-water mark.
    pub queue_capacity: usize,
    /// Hard ceiling on buffered-but-unsent records; overflow drops oldest.
    pub pending_hard_limit: usize,
    /// Send attempts per batch before it is dropped and counted.
    pub sink_retry_attempts: u32,
    /// Quiet-stream interval after which the runtime is probed.
    pub stall_timeout: Duration,
    /// Per-worker grace period for flushing on termination.
    pub drain_grace: Duration,
    /// Global grace period for worker drain on shutdown.
    pub shutdown_grace: Duration,
    /// Upper bound on a single log-stream connection attempt.
    pub connect_timeout: Duration,
    /// Streaming this long resets the consecutive-failure count.
    pub failure_reset_after: Duration,
}

impl Settings {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingToken`] when `LOGDOCK_TOKEN` is unset and
    /// [`Error::InvalidValue`] for unparseable numeric or boolean values.
    /// Both are fatal; there is no degraded mode without a credential.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Settings with every default and a dummy token, for unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::from_lookup(|key| (key == TOKEN).then(|| "test-token".to_owned()))
            .expect("defaults are valid")
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let token = lookup(TOKEN)
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingToken(TOKEN))?;
        let service_name = lookup(SERVICE_NAME).unwrap_or_else(|| "logdock".to_owned());
        let exclude_containers = lookup(EXCLUDE_CONTAINERS)
            .map(|raw| parse_name_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            token,
            sink_url: lookup(SINK_URL)
                .unwrap_or_else(|| "http://127.0.0.1:4318/v1/logs".to_owned()),
            service_name,
            docker_socket: lookup(DOCKER_SOCKET)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/run/docker.sock")),
            exclude_containers,
            include_stopped: parse_opt(INCLUDE_STOPPED, lookup(INCLUDE_STOPPED), parse_bool)?
                .unwrap_or(false),
            batch_max_records: parse_opt(BATCH_MAX_RECORDS, lookup(BATCH_MAX_RECORDS), |v| {
                v.parse().ok().filter(|n| *n > 0)
            })?
            .unwrap_or(512),
            batch_max_delay: parse_opt(BATCH_MAX_DELAY_MS, lookup(BATCH_MAX_DELAY_MS), |v| {
                v.parse().ok().map(Duration::from_millis)
            })?
            .unwrap_or(Duration::from_secs(2)),
            queue_capacity: parse_opt(QUEUE_CAPACITY, lookup(QUEUE_CAPACITY), |v| {
                v.parse().ok().filter(|n| *n > 0)
            })?
            .unwrap_or(4096),
            pending_hard_limit: parse_opt(
                PENDING_HARD_LIMIT,
                lookup(PENDING_HARD_LIMIT),
                |v| v.parse().ok().filter(|n| *n > 0),
            )?
            .unwrap_or(16384),
            sink_retry_attempts: parse_opt(
                SINK_RETRY_ATTEMPTS,
                lookup(SINK_RETRY_ATTEMPTS),
                |v| v.parse().ok(),
            )?
            .unwrap_or(5),
            stall_timeout: parse_opt(STALL_TIMEOUT_SECS, lookup(STALL_TIMEOUT_SECS), |v| {
                v.parse().ok().map(Duration::from_secs)
            })?
            .unwrap_or(Duration::from_secs(60)),
            drain_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            failure_reset_after: Duration::from_secs(30),
        })
    }
}

/// Filter for the engine's own diagnostics, in `env_logger` syntax.
///
/// Read separately from [`Settings::from_env`] so the logger is up before
/// the rest of the configuration is validated. `RUST_LOG` still wins.
pub fn log_level() -> String {
    std::env::var(LOG_LEVEL).unwrap_or_else(|_| "info".to_owned())
}

fn parse_opt<T>(
    key: &'static str,
    value: Option<String>,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => parse(raw.trim())
            .map(Some)
            .ok_or(Error::InvalidValue { key, value: raw }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_token_is_fatal() {
        let err = Settings::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, Error::MissingToken(_)));
    }

    #[test]
    fn empty_token_is_fatal() {
        let err = Settings::from_lookup(lookup_from(&[("LOGDOCK_TOKEN", "")])).unwrap_err();
        assert!(matches!(err, Error::MissingToken(_)));
    }

    #[test]
    fn defaults_apply_when_only_token_is_set() {
        let settings =
            Settings::from_lookup(lookup_from(&[("LOGDOCK_TOKEN", "secret")])).unwrap();
        assert_eq!(settings.token, "secret");
        assert_eq!(settings.service_name, "logdock");
        assert_eq!(
            settings.docker_socket,
            PathBuf::from("/var/run/docker.sock")
        );
        assert!(!settings.include_stopped);
        assert!(settings.exclude_containers.is_empty());
        assert_eq!(settings.batch_max_records, 512);
        assert_eq!(settings.batch_max_delay, Duration::from_secs(2));
        assert_eq!(settings.queue_capacity, 4096);
    }

    #[test]
    fn exclude_list_is_split_and_trimmed() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("LOGDOCK_TOKEN", "t"),
            ("LOGDOCK_EXCLUDE_CONTAINERS", "web, db ,,  cache"),
        ]))
        .unwrap();
        assert_eq!(settings.exclude_containers, vec!["web", "db", "cache"]);
    }

    #[test]
    fn boolean_values_parse_flexibly() {
        for truthy in ["1", "true", "YES"] {
            let settings = Settings::from_lookup(lookup_from(&[
                ("LOGDOCK_TOKEN", "t"),
                ("LOGDOCK_INCLUDE_STOPPED", truthy),
            ]))
            .unwrap();
            assert!(settings.include_stopped, "value={truthy}");
        }

        let err = Settings::from_lookup(lookup_from(&[
            ("LOGDOCK_TOKEN", "t"),
            ("LOGDOCK_INCLUDE_STOPPED", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = Settings::from_lookup(lookup_from(&[
            ("LOGDOCK_TOKEN", "t"),
            ("LOGDOCK_BATCH_MAX_RECORDS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }
}
