use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};

/// In-process Loki stand-in: serves `/ready`, a scriptable `query_range`
/// and a `tail` websocket fed by `push_tail_frame`. Every range and tail
/// request is recorded so tests can assert on parameters and headers.
pub struct MockLoki {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

pub enum RangeReply {
    Batch(Value),
    Failure(u16, String),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub params: HashMap<String, String>,
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
}

struct MockState {
    ready: AtomicBool,
    range_replies: Mutex<VecDeque<RangeReply>>,
    range_requests: Mutex<Vec<RecordedRequest>>,
    tail_requests: Mutex<Vec<RecordedRequest>>,
    tail_frames: broadcast::Sender<String>,
}

impl MockLoki {
    pub async fn start() -> Result<Self> {
        let (tail_frames, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            ready: AtomicBool::new(true),
            range_replies: Mutex::new(VecDeque::new()),
            range_requests: Mutex::new(Vec::new()),
            tail_requests: Mutex::new(Vec::new()),
            tail_frames,
        });

        let app = Router::new()
            .route("/ready", get(ready))
            .route("/loki/api/v1/query_range", get(query_range))
            .route("/loki/api/v1/tail", get(tail))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind the mock loki listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read the mock loki address")?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            state,
            server,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.ready.store(ready, Ordering::SeqCst);
    }

    pub fn script_range_reply(&self, reply: RangeReply) {
        self.state
            .range_replies
            .lock()
            .expect("range replies lock")
            .push_back(reply);
    }

    pub fn range_requests(&self) -> Vec<RecordedRequest> {
        self.state
            .range_requests
            .lock()
            .expect("range requests lock")
            .clone()
    }

    pub fn tail_requests(&self) -> Vec<RecordedRequest> {
        self.state
            .tail_requests
            .lock()
            .expect("tail requests lock")
            .clone()
    }

    pub fn tail_listeners(&self) -> usize {
        self.state.tail_frames.receiver_count()
    }

    pub fn push_tail_frame(&self, frame: Value) {
        let _ = self.state.tail_frames.send(frame.to_string());
    }
}

impl Drop for MockLoki {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// `query_range` body with the given streams.
pub fn range_body(streams: Vec<Value>) -> Value {
    json!({
        "status": "success",
        "data": {
            "resultType": "streams",
            "result": streams,
            "stats": {}
        }
    })
}

/// One stream with nanosecond timestamps encoded the way Loki sends them.
pub fn stream_body(labels: Value, entries: &[(i64, String)]) -> Value {
    let values: Vec<Value> = entries
        .iter()
        .map(|(timestamp, line)| json!([timestamp.to_string(), line]))
        .collect();
    json!({"stream": labels, "values": values})
}

pub fn tail_frame(streams: Vec<Value>) -> Value {
    json!({"streams": streams, "dropped_entries": []})
}

fn record(params: HashMap<String, String>, headers: &HeaderMap) -> RecordedRequest {
    let header_text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    RecordedRequest {
        params,
        authorization: header_text(header::AUTHORIZATION),
        user_agent: header_text(header::USER_AGENT),
    }
}

async fn ready(State(state): State<Arc<MockState>>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn query_range(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state
        .range_requests
        .lock()
        .expect("range requests lock")
        .push(record(params, &headers));

    let reply = state
        .range_replies
        .lock()
        .expect("range replies lock")
        .pop_front();
    match reply {
        Some(RangeReply::Failure(status, body)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        )
            .into_response(),
        Some(RangeReply::Batch(body)) => Json(body).into_response(),
        None => Json(range_body(Vec::new())).into_response(),
    }
}

async fn tail(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    state
        .tail_requests
        .lock()
        .expect("tail requests lock")
        .push(record(params, &headers));

    let frames = state.tail_frames.subscribe();
    upgrade.on_upgrade(move |socket| stream_tail(socket, frames))
}

async fn stream_tail(mut socket: WebSocket, mut frames: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => continue,
                _ => return,
            },
        }
    }
}
