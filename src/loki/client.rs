use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::sleep};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, header},
        protocol::Message,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::ResolvedConfig,
    error::LokiError,
    loki::{
        types::{QueryRangeResponse, TailResponse},
        url as loki_url,
    },
};

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Facade over the Loki HTTP and websocket APIs. Immutable once built; all
/// acquisition state lives in the tasks it spawns.
#[derive(Clone)]
pub struct LokiClient {
    http: reqwest::Client,
    config: Arc<ResolvedConfig>,
}

impl LokiClient {
    pub fn new(config: ResolvedConfig) -> Result<Self> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = reqwest::header::HeaderName::try_from(name.as_str())
                .with_context(|| format!("invalid header name {name}"))?;
            let header_value = reqwest::header::HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            default_headers.insert(header_name, header_value);
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(default_headers)
            .build()
            .context("failed to build the Loki HTTP client")?;

        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Polls `/ready` every 500ms until Loki answers 200, the configured
    /// `wait_for_ready` deadline passes, or the token fires. The last failed
    /// attempt is carried into the deadline error so an unreachable host is
    /// diagnosable from the message alone.
    pub async fn ready(&self, cancel: &CancellationToken) -> Result<(), LokiError> {
        let url = self.endpoint(loki_url::READY_ENDPOINT, Vec::new());
        let mut last_attempt = String::from("no response from /ready");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(LokiError::Cancelled),
            outcome = tokio::time::timeout(
                self.config.wait_for_ready,
                self.poll_ready(&url, &mut last_attempt),
            ) => outcome,
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(_) => Err(LokiError::DeadlineExceeded {
                waited: self.config.wait_for_ready,
                last_attempt,
            }),
        }
    }

    async fn poll_ready(&self, url: &url::Url, last_attempt: &mut String) {
        loop {
            let request = self.config.auth.apply(self.http.get(url.clone()));
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let _ = response.bytes().await;
                    if status == StatusCode::OK {
                        return;
                    }
                    debug!(%status, "loki is not ready yet");
                    *last_attempt = format!("status {status}");
                }
                Err(error) => {
                    debug!(%error, "loki readiness probe failed");
                    *last_attempt = error_chain(&error);
                }
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Spawns the range paginator. Batches arrive on the returned channel;
    /// the channel closing means the window is drained or the paginator
    /// failed, and the join handle tells the two apart.
    pub fn query_range(
        &self,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<QueryRangeResponse>,
        JoinHandle<Result<(), LokiError>>,
    ) {
        let (batches, receiver) = mpsc::channel(1);
        let client = self.clone();
        let handle = tokio::spawn(async move { client.paginate_range(batches, cancel).await });
        (receiver, handle)
    }

    async fn paginate_range(
        &self,
        batches: mpsc::Sender<QueryRangeResponse>,
        cancel: CancellationToken,
    ) -> Result<(), LokiError> {
        let limit = self.config.limit;
        let mut start = timestamp_nanos(Utc::now() - self.config.since);

        loop {
            let end = timestamp_nanos(Utc::now() - self.config.delay_for);
            let url = self.endpoint(
                loki_url::QUERY_RANGE_ENDPOINT,
                vec![
                    ("query", self.config.query.clone()),
                    ("start", start.to_string()),
                    ("end", end.to_string()),
                    ("limit", limit.to_string()),
                    ("direction", "forward".to_string()),
                ],
            );

            let request = self.config.auth.apply(self.http.get(url));
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                response = request.send() => response?,
            };

            let status = response.status();
            if status != StatusCode::OK {
                let body = response.text().await.unwrap_or_default();
                return Err(LokiError::UnexpectedStatus { status, body });
            }

            let body = response.bytes().await?;
            let batch: QueryRangeResponse = serde_json::from_slice(&body)?;

            let first_stream_len = batch
                .data
                .result
                .first()
                .map(|stream| stream.entries.len())
                .unwrap_or(0);
            let exhausted = batch.data.result.is_empty() || first_stream_len < limit;
            let next_start = batch.data.max_timestamp();
            debug!(
                streams = batch.data.result.len(),
                first_stream_len, exhausted, "received query_range batch"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = batches.send(batch) => {
                    if sent.is_err() {
                        debug!("query_range consumer went away, stopping pagination");
                        return Ok(());
                    }
                }
            }

            if exhausted {
                return Ok(());
            }
            if let Some(timestamp) = next_start {
                start = timestamp;
            }
        }
    }

    /// Dials the tail websocket and spawns the reader. Dial failures are
    /// returned synchronously, with the server's response body when it sent
    /// one. The reader forwards decoded frames until the token fires, the
    /// server closes, or a read fails.
    pub async fn tail(
        &self,
        cancel: CancellationToken,
    ) -> Result<
        (
            mpsc::Receiver<TailResponse>,
            JoinHandle<Result<(), LokiError>>,
        ),
        LokiError,
    > {
        let start = timestamp_nanos(Utc::now() - self.config.since);
        let url = self.endpoint(
            loki_url::TAIL_ENDPOINT,
            vec![
                ("query", self.config.query.clone()),
                ("limit", self.config.limit.to_string()),
                ("start", start.to_string()),
            ],
        );

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        for (name, value) in &self.config.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(header_name), Ok(header_value)) => {
                    headers.insert(header_name, header_value);
                }
                _ => warn!(header = %name, "skipping header invalid for the websocket upgrade"),
            }
        }
        if let Some(authorization) = self.config.auth.authorization_header() {
            headers.insert(header::AUTHORIZATION, authorization);
        }

        let (socket, response) = tokio::select! {
            _ = cancel.cancelled() => return Err(LokiError::Cancelled),
            connected = connect_async(request) => connected.map_err(handshake_error)?,
        };
        debug!(status = %response.status(), "loki tail websocket established");

        let (responses, receiver) = mpsc::channel(1);
        let handle = tokio::spawn(read_tail_frames(socket, responses, cancel));
        Ok((receiver, handle))
    }

    fn endpoint(&self, endpoint: &str, params: Vec<(&str, String)>) -> url::Url {
        loki_url::endpoint_url(&self.config.base_url, &self.config.prefix, endpoint, &params)
    }
}

async fn read_tail_frames(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    responses: mpsc::Sender<TailResponse>,
    cancel: CancellationToken,
) -> Result<(), LokiError> {
    loop {
        // both a fired token and an ended stream leave `frame` empty; closing
        // an already-terminated socket is harmless
        let frame = tokio::select! {
            _ = cancel.cancelled() => None,
            frame = socket.next() => frame,
        };

        let Some(frame) = frame else {
            return close_socket(socket).await;
        };

        match frame {
            Err(error) => return Err(LokiError::WebSocket(error)),
            Ok(Message::Text(text)) => {
                if text.is_empty() {
                    // loki sends empty frames when nothing arrived this tick
                    continue;
                }
                let response: TailResponse = serde_json::from_str(&text)?;
                let sent = tokio::select! {
                    _ = cancel.cancelled() => None,
                    sent = responses.send(response) => Some(sent),
                };
                match sent {
                    Some(Ok(())) => {}
                    Some(Err(_)) => {
                        debug!("tail consumer went away, closing the websocket");
                        return close_socket(socket).await;
                    }
                    None => return close_socket(socket).await,
                }
            }
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => continue,
        }
    }
}

async fn close_socket(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<(), LokiError> {
    if let Err(error) = socket.close(None).await {
        debug!(%error, "closing the loki tail websocket");
    }
    Ok(())
}

fn handshake_error(error: tungstenite::Error) -> LokiError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_deref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            LokiError::Handshake { status, body }
        }
        other => LokiError::WebSocket(other),
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

// Total over the nanosecond-representable range (1677..2262); the fallback
// is unreachable for wall-clock inputs.
fn timestamp_nanos(value: DateTime<Utc>) -> i64 {
    value.timestamp_nanos_opt().unwrap_or_default()
}
