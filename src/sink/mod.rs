//! Telemetry sink interface.
//!
//! The forwarder only ever hands a sink a batch of records and looks at
//! the per-batch result; transport and authentication are the sink's
//! concern entirely.

use crate::enrich::LogRecord;

mod http;

pub use http::HttpSink;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sink endpoint `{0}` is not a valid uri")]
    InvalidEndpoint(String),
    #[error("failed to reach sink: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("sink rejected batch with status {0}")]
    Rejected(hyper::StatusCode),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Accepts batches of log records.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    /// Delivers one batch; an error means the whole batch may be retried.
    async fn send_batch(&self, batch: &[LogRecord]) -> Result<()>;
}
