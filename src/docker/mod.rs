//! Container runtime capability interface and its Docker implementation.
//!
//! The engine only needs four operations from a runtime: enumerate
//! containers, inspect one, subscribe to lifecycle events, and open a
//! combined stdout/stderr byte stream with an optional starting point. Any
//! runtime exposing these is substitutable; tests use an in-memory mock.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::Stream;

use crate::container::{ContainerID, ContainerRecord};

mod client;

pub use client::DockerClient;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to runtime socket `{path}`: {source}")]
    SocketConnect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("http handshake with runtime failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("runtime request failed: {0}")]
    Request(#[source] hyper::Error),
    #[error("runtime answered `{endpoint}` with unexpected status {status}")]
    UnexpectedStatus {
        endpoint: String,
        status: hyper::StatusCode,
    },
    #[error("failed to read runtime response body: {0}")]
    Body(#[source] hyper::Error),
    #[error("failed to decode runtime payload: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("container id in runtime payload is invalid: {0}")]
    InvalidID(#[source] crate::container::Error),
    #[error("container `{0}` is gone")]
    NotFound(ContainerID),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle transitions the discovery loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
    Die,
    Destroy,
}

impl EventAction {
    /// Maps a runtime action string; `None` for actions the engine ignores
    /// (exec, health, prune and friends).
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "die" => Some(Self::Die),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

/// One container lifecycle event.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub id: ContainerID,
    pub name: String,
    pub action: EventAction,
}

/// Resume point for a log stream: wall-clock time of the last frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    secs: u64,
    nanos: u32,
}

impl LogCursor {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs(),
            nanos: elapsed.subsec_nanos(),
        }
    }
}

impl fmt::Display for LogCursor {
    /// Formats as the `seconds.nanoseconds` form runtime APIs accept.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Where a log stream starts before it begins following new output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStart {
    /// Only output produced after the connection opens.
    New,
    /// The most recent `n` lines of history, then follow. Used for
    /// already-stopped containers, whose output all lies in the past.
    Tail(u32),
    /// Everything after the cursor, then follow.
    Since(LogCursor),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ContainerEvent>> + Send>>;

/// An open follow log stream.
pub struct LogStream {
    /// Whether payloads use the multiplexed framing (false for TTY
    /// containers, which serve raw bytes).
    pub multiplexed: bool,
    pub bytes: ByteStream,
}

/// The four runtime operations the engine depends on.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Enumerates containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRecord>>;

    /// Full metadata snapshot for one container, `None` once it is gone.
    async fn inspect(&self, id: &ContainerID) -> Result<Option<ContainerRecord>>;

    /// Subscribes to container lifecycle events from now on.
    async fn events(&self) -> Result<EventStream>;

    /// Opens a combined stdout/stderr stream, following new output after
    /// the requested starting point. `tty` is the caller's knowledge of
    /// the container's TTY mode, used when the runtime does not label the
    /// stream format.
    async fn open_log_stream(
        &self,
        id: &ContainerID,
        start: LogStart,
        tty: bool,
    ) -> Result<LogStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_formats_with_nanosecond_padding() {
        let cursor = LogCursor {
            secs: 1136073600,
            nanos: 42,
        };
        assert_eq!(cursor.to_string(), "1136073600.000000042");
    }

    #[test]
    fn only_lifecycle_actions_are_mapped() {
        assert_eq!(EventAction::from_action("start"), Some(EventAction::Start));
        assert_eq!(EventAction::from_action("die"), Some(EventAction::Die));
        assert_eq!(EventAction::from_action("destroy"), Some(EventAction::Destroy));
        assert_eq!(EventAction::from_action("exec_create: sh"), None);
        assert_eq!(EventAction::from_action("health_status"), None);
    }
}
