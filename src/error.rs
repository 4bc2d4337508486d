use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced by the Loki client. Cancellation is modelled as a
/// variant so callers can turn an externally requested shutdown into a
/// clean exit instead of a failure.
#[derive(Debug, Error)]
pub enum LokiError {
    #[error("cancelled")]
    Cancelled,
    #[error("no 200 from /ready within {waited:?} (last attempt: {last_attempt})")]
    DeadlineExceeded {
        waited: Duration,
        last_attempt: String,
    },
    #[error("loki returned status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("loki tail handshake rejected with status {status}: {body}")]
    Handshake { status: StatusCode, body: String },
    #[error("request to loki failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("loki websocket failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to decode loki response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LokiError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
