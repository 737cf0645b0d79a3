//! Batch delivery over plain HTTP, for self-hosted collector endpoints.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Uri, header};
use hyper_util::rt::TokioIo;

use super::{Error, LogSink, Result};
use crate::enrich::LogRecord;

/// POSTs each batch as a JSON array with a bearer token.
pub struct HttpSink {
    host: String,
    port: u16,
    authority: String,
    path: String,
    auth_value: String,
}

impl HttpSink {
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] when the endpoint is not an
    /// absolute `http` uri with a host. TLS endpoints need a terminating
    /// proxy in front of this sink.
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|_| Error::InvalidEndpoint(endpoint.to_owned()))?;
        if uri.scheme_str() != Some("http") {
            return Err(Error::InvalidEndpoint(endpoint.to_owned()));
        }
        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidEndpoint(endpoint.to_owned()))?
            .to_owned();
        let port = uri.port_u16().unwrap_or(80);
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| host.clone());

        Ok(Self {
            host,
            port,
            authority,
            path: uri.path().to_owned(),
            auth_value: format!("Bearer {token}"),
        })
    }
}

#[async_trait::async_trait]
impl LogSink for HttpSink {
    async fn send_batch(&self, batch: &[LogRecord]) -> Result<()> {
        let payload =
            serde_json::to_vec(batch).map_err(|err| Error::Transport(Box::new(err)))?;

        let stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|err| Error::Transport(Box::new(err)))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|err| Error::Transport(Box::new(err)))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("sink connection closed: {err}");
            }
        });

        let request = Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.path)
            .header(header::HOST, &self.authority)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, &self.auth_value)
            .body(Full::new(Bytes::from(payload)))
            .expect("request construction from valid parts");

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| Error::Transport(Box::new(err)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Rejected(response.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_parts() {
        let sink = HttpSink::new("http://collector:4318/v1/logs", "secret").unwrap();
        assert_eq!(sink.host, "collector");
        assert_eq!(sink.port, 4318);
        assert_eq!(sink.path, "/v1/logs");
        assert_eq!(sink.auth_value, "Bearer secret");
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(matches!(
            HttpSink::new("https://collector/v1/logs", "t"),
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpSink::new("not a uri", "t"),
            Err(Error::InvalidEndpoint(_))
        ));
    }
}
