//! Turns decoded log lines into attributed, sequenced records.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::container::ContainerRecord;
use crate::demux::StreamKind;

/// One attributed log line, owned by the forwarder until the sink accepts
/// it or drop policy applies.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub container_id: Arc<str>,
    pub service_name: Arc<str>,
    /// Image reference of the originating container.
    #[serde(skip_serializing_if = "image_is_empty")]
    pub container_image: Arc<str>,
    pub stream: StreamKind,
    /// RFC3339 timestamp reported by the runtime, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub message: String,
    /// Strictly increasing and gapless per container while its worker lives.
    pub sequence: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Per-worker enrichment state.
///
/// Identity attributes are snapshotted from the container record at worker
/// start; a later rename never changes attribution of an open stream. No
/// I/O, deterministic apart from the advancing sequence counter.
#[derive(Debug)]
pub struct Enricher {
    container_id: Arc<str>,
    service_name: Arc<str>,
    container_image: Arc<str>,
    labels: HashMap<String, String>,
    next_sequence: u64,
}

impl Enricher {
    pub fn new(container: &ContainerRecord) -> Self {
        Self {
            container_id: container.id().to_arc(),
            service_name: container.name().into(),
            container_image: container.image().into(),
            labels: container.labels().clone(),
            next_sequence: 0,
        }
    }

    /// Builds the record for one decoded line and advances the sequence.
    ///
    /// Log streams are requested with runtime timestamps, so each line
    /// normally starts with an RFC3339 timestamp; it is split off into the
    /// record's timestamp field. Lines without a recognizable prefix keep
    /// their full content as the message.
    pub fn enrich(&mut self, kind: StreamKind, line: &str) -> LogRecord {
        let (timestamp, message) = split_timestamp_prefix(line);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        LogRecord {
            container_id: Arc::clone(&self.container_id),
            service_name: Arc::clone(&self.service_name),
            container_image: Arc::clone(&self.container_image),
            stream: kind,
            timestamp: timestamp.map(str::to_owned),
            message: message.to_owned(),
            sequence,
            labels: self.labels.clone(),
        }
    }
}

fn image_is_empty(image: &Arc<str>) -> bool {
    image.is_empty()
}

/// Splits a leading `<rfc3339-timestamp> ` prefix off a line.
fn split_timestamp_prefix(line: &str) -> (Option<&str>, &str) {
    let Some((candidate, rest)) = line.split_once(' ') else {
        return (None, line);
    };
    if looks_like_rfc3339(candidate) {
        (Some(candidate), rest)
    } else {
        (None, line)
    }
}

fn looks_like_rfc3339(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    bytes.len() >= 20
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[10] == b'T'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && candidate.ends_with('Z')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerID, ContainerStatus};

    fn enricher() -> Enricher {
        let mut labels = HashMap::new();
        labels.insert("com.example.stack".to_owned(), "prod".to_owned());
        let record = ContainerRecord::new(
            ContainerID::new("feedface0123").unwrap(),
            "/web",
            "nginx:1.27",
            labels,
            ContainerStatus::Running,
            false,
        );
        Enricher::new(&record)
    }

    #[test]
    fn sequences_are_gapless_and_increasing() {
        let mut enricher = enricher();
        let sequences: Vec<u64> = (0..5)
            .map(|_| enricher.enrich(StreamKind::Stdout, "line").sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn timestamp_prefix_is_split_off() {
        let mut enricher = enricher();
        let record = enricher.enrich(
            StreamKind::Stdout,
            "2025-05-23T20:03:59.691483928Z listening on :8080",
        );
        assert_eq!(
            record.timestamp.as_deref(),
            Some("2025-05-23T20:03:59.691483928Z")
        );
        assert_eq!(record.message, "listening on :8080");
    }

    #[test]
    fn line_without_timestamp_is_kept_whole() {
        let mut enricher = enricher();
        let record = enricher.enrich(StreamKind::Stderr, "plain output without prefix");
        assert_eq!(record.timestamp, None);
        assert_eq!(record.message, "plain output without prefix");

        let record = enricher.enrich(StreamKind::Stderr, "2025 was a good year");
        assert_eq!(record.timestamp, None);
        assert_eq!(record.message, "2025 was a good year");
    }

    #[test]
    fn identity_attributes_are_attached() {
        let mut enricher = enricher();
        let record = enricher.enrich(StreamKind::Stderr, "x");
        assert_eq!(&*record.container_id, "feedface0123");
        assert_eq!(&*record.service_name, "web");
        assert_eq!(&*record.container_image, "nginx:1.27");
        assert_eq!(record.stream, StreamKind::Stderr);
        assert_eq!(record.labels.get("com.example.stack").unwrap(), "prod");
    }

    #[test]
    fn record_serializes_with_lowercase_stream() {
        let mut enricher = enricher();
        let record = enricher.enrich(StreamKind::Stderr, "boom");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["sequence"], 0);
        assert_eq!(json["service_name"], "web");
        assert_eq!(json["container_image"], "nginx:1.27");
    }
}
