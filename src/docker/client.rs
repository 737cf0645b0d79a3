//! Docker Engine API client speaking HTTP/1.1 over the daemon's unix
//! socket. One short-lived connection per request; follow streams keep
//! their connection open for the lifetime of the body.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{
    ByteStream, ContainerEvent, ContainerRuntime, Error, EventAction, EventStream, LogStart,
    LogStream, Result,
};
use crate::container::{ContainerID, ContainerRecord, ContainerStatus};

/// Pre-encoded `{"type":["container"]}` event filter.
const EVENT_FILTERS: &str = "%7B%22type%22%3A%5B%22container%22%5D%7D";

const RAW_STREAM: &str = "application/vnd.docker.raw-stream";
const MULTIPLEXED_STREAM: &str = "application/vnd.docker.multiplexed-stream";

pub struct DockerClient {
    socket_path: PathBuf,
}

impl DockerClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    async fn get(&self, endpoint: &str) -> Result<Response<Incoming>> {
        let stream = tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| Error::SocketConnect {
                path: self.socket_path.clone(),
                source,
            })?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(Error::Handshake)?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("runtime connection closed: {err}");
            }
        });

        let request = Request::builder()
            .uri(endpoint)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .expect("request construction from valid parts");
        sender.send_request(request).await.map_err(Error::Request)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let response = self.get(endpoint).await?;
        if response.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                endpoint: endpoint.to_owned(),
                status: response.status(),
            });
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(Error::Body)?
            .to_bytes();
        serde_json::from_slice(&body).map_err(Error::Decode)
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRecord>> {
        let endpoint = format!("/containers/json?all={all}");
        let summaries: Vec<ContainerSummary> = self.get_json(&endpoint).await?;
        let mut records = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let id = ContainerID::new(&summary.id).map_err(Error::InvalidID)?;
            records.push(ContainerRecord::new(
                id,
                summary.names.into_iter().next().unwrap_or_default(),
                summary.image,
                summary.labels.unwrap_or_default(),
                ContainerStatus::from_runtime_state(&summary.state),
                false,
            ));
        }
        Ok(records)
    }

    async fn inspect(&self, id: &ContainerID) -> Result<Option<ContainerRecord>> {
        let endpoint = format!("/containers/{id}/json");
        let response = self.get(&endpoint).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            status => {
                return Err(Error::UnexpectedStatus {
                    endpoint,
                    status,
                });
            }
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(Error::Body)?
            .to_bytes();
        let detail: ContainerDetail = serde_json::from_slice(&body).map_err(Error::Decode)?;
        let id = ContainerID::new(&detail.id).map_err(Error::InvalidID)?;
        Ok(Some(ContainerRecord::new(
            id,
            detail.name,
            detail.config.image,
            detail.config.labels.unwrap_or_default(),
            ContainerStatus::from_runtime_state(&detail.state.status),
            detail.config.tty,
        )))
    }

    async fn events(&self) -> Result<EventStream> {
        let endpoint = format!("/events?filters={EVENT_FILTERS}");
        let response = self.get(&endpoint).await?;
        if response.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                endpoint,
                status: response.status(),
            });
        }

        // The event feed is an unbounded sequence of JSON objects, one per
        // line. Undecodable or uninteresting lines are skipped, not fatal.
        let state = JsonLines {
            body: response.into_body(),
            buf: BytesMut::new(),
        };
        let stream = stream::unfold(state, |mut state| async move {
            loop {
                while let Some(line) = state.next_line() {
                    match serde_json::from_slice::<ApiEvent>(&line) {
                        Ok(event) => {
                            if let Some(event) = convert_event(event) {
                                return Some((Ok(event), state));
                            }
                        }
                        Err(err) => {
                            log::debug!("skipping undecodable runtime event: {err}");
                        }
                    }
                }
                match state.body.frame().await {
                    None => return None,
                    Some(Err(err)) => return Some((Err(Error::Body(err)), state)),
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            state.buf.extend_from_slice(&data);
                        }
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn open_log_stream(
        &self,
        id: &ContainerID,
        start: LogStart,
        tty: bool,
    ) -> Result<LogStream> {
        let mut endpoint =
            format!("/containers/{id}/logs?follow=true&stdout=true&stderr=true&timestamps=true");
        match start {
            LogStart::New => endpoint.push_str("&tail=0"),
            LogStart::Tail(lines) => {
                let _ = write!(endpoint, "&tail={lines}");
            }
            // Resume: replay everything after the cursor, then follow.
            LogStart::Since(cursor) => {
                let _ = write!(endpoint, "&since={cursor}");
            }
        }

        let response = self.get(&endpoint).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(id.clone())),
            status => {
                return Err(Error::UnexpectedStatus {
                    endpoint,
                    status,
                });
            }
        }

        let multiplexed = match response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            Some(RAW_STREAM) => false,
            Some(MULTIPLEXED_STREAM) => true,
            // Older daemons label neither; trust the inspect snapshot.
            _ => !tty,
        };

        let bytes: ByteStream = Box::pin(stream::unfold(
            response.into_body(),
            |mut body| async move {
                loop {
                    match body.frame().await {
                        None => return None,
                        Some(Err(err)) => return Some((Err(Error::Body(err)), body)),
                        Some(Ok(frame)) => {
                            if let Ok(data) = frame.into_data() {
                                return Some((Ok(data), body));
                            }
                        }
                    }
                }
            },
        ));

        Ok(LogStream { multiplexed, bytes })
    }
}

struct JsonLines {
    body: Incoming,
    buf: BytesMut,
}

impl JsonLines {
    /// Pops the next non-empty line from the buffer.
    fn next_line(&mut self) -> Option<Bytes> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if !line.is_empty() {
                return Some(line.freeze());
            }
        }
        None
    }
}

fn convert_event(event: ApiEvent) -> Option<ContainerEvent> {
    let action = EventAction::from_action(&event.action)?;
    let id = match ContainerID::new(&event.id) {
        Ok(id) => id,
        Err(err) => {
            log::warn!("runtime event carried an invalid container id: {err}");
            return None;
        }
    };
    let name = event
        .actor
        .attributes
        .get("name")
        .cloned()
        .unwrap_or_default();
    Some(ContainerEvent { id, name, action })
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
    #[serde(rename = "State", default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct ContainerDetail {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: DetailState,
    #[serde(rename = "Config", default)]
    config: DetailConfig,
}

#[derive(Debug, Default, Deserialize)]
struct DetailState {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct DetailConfig {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
    #[serde(rename = "Tty", default)]
    tty: bool,
}

#[derive(Debug, Deserialize)]
struct ApiEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(default)]
    id: String,
    #[serde(rename = "Actor", default)]
    actor: ApiActor,
}

#[derive(Debug, Default, Deserialize)]
struct ApiActor {
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}
