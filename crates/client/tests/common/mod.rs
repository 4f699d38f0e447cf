//! In-process mock of the compute service for integration tests.
//!
//! Serves the REST endpoints and both push channels from scripted state.
//! Every channel connection is recorded, together with the close code the
//! client sent when it hung up.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

/// Frames pushed to one channel connection right after it connects.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub frames: Vec<String>,
    /// Send a 1000 close after the last frame.
    pub close_after: bool,
    /// Pause before each frame.
    pub gap: Duration,
}

/// One channel connection as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub key: String,
    /// Close code received from the client; `None` if it vanished without one.
    pub client_close: Option<u16>,
}

#[derive(Default)]
pub struct MockState {
    pub blocks: Mutex<Vec<Value>>,
    pub details: Mutex<HashMap<u32, Value>>,
    pub primes: Mutex<Vec<Value>>,
    /// Final state served by `GET /jobs/{id}`.
    pub runs: Mutex<HashMap<String, Value>>,
    pub digits_replies: Mutex<VecDeque<Value>>,
    pub artifact: Mutex<Vec<u8>>,
    /// Per key, one script per connection; the last one repeats.
    pub scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    pub opened: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<Connection>>,
    pub reject_runs: AtomicBool,
    next_id: AtomicU32,
}

impl MockState {
    pub fn script(&self, key: &str, frames: &[&str], close_after: bool) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(Script {
                frames: frames.iter().map(|f| f.to_string()).collect(),
                close_after,
                gap: Duration::from_millis(10),
            });
    }

    /// Push all `frames` back to back as soon as the channel connects.
    pub fn burst(&self, key: &str, frames: Vec<String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(Script {
                frames,
                close_after: false,
                gap: Duration::ZERO,
            });
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<Connection> {
        self.closed.lock().unwrap().clone()
    }

    /// Wait until the server has seen the client hang up on `key`.
    pub async fn wait_closed(&self, key: &str) -> Connection {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(conn) = self.closed().into_iter().find(|c| c.key == key) {
                    return conn;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("channel was not closed in time")
    }
}

pub fn block_json(id: u32, tested: u64, total: u64, status: &str) -> Value {
    json!({
        "id": id,
        "start": id as u64 * 1_000_000,
        "end_excl": (id as u64 + 1) * 1_000_000,
        "label": format!("{id}-{}M", id + 1),
        "candidate_count": total,
        "tested_count": tested,
        "verified_count": 0,
        "status": status,
    })
}

pub fn detail_json(id: u32, tested: u64, total: u64) -> Value {
    json!({
        "block": block_json(id, tested, total, "running"),
        "exponents": [
            {"p": id as u64 * 1_000_000 + 3, "status": "done", "is_prime": 0},
            {"p": id as u64 * 1_000_000 + 7, "status": "queued", "is_prime": null},
        ],
    })
}

/// Start the mock on an ephemeral port and return its base URL.
pub async fn spawn_mock(state: Arc<MockState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock listener");
    let addr = listener.local_addr().expect("mock address");
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.expect("mock server");
    });
    format!("http://{addr}")
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/blocks", get(list_blocks))
        .route("/blocks/{id}", get(block_detail))
        .route("/blocks/{id}/start", post(start_block))
        .route("/blocks/{id}/stop", post(stop_block))
        .route("/primes", get(list_primes))
        .route("/primes/count", get(prime_count))
        .route("/jobs", post(submit_run))
        .route("/jobs/{id}", get(run_status))
        .route("/digits", post(submit_digits))
        .route("/digits/{id}", get(digits_status))
        .route("/digits/{id}/download", get(download))
        .route("/ws/blocks/{id}", get(block_channel))
        .route("/ws/jobs/{id}", get(job_channel))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

async fn list_blocks(State(state): State<Arc<MockState>>) -> Json<Value> {
    Json(Value::Array(state.blocks.lock().unwrap().clone()))
}

async fn block_detail(State(state): State<Arc<MockState>>, Path(id): Path<u32>) -> Response {
    match state.details.lock().unwrap().get(&id) {
        Some(detail) => Json(detail.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"detail": "not found"}))).into_response(),
    }
}

async fn start_block(Path(id): Path<u32>) -> Json<Value> {
    Json(json!({"scheduled": 2, "block_id": id, "concurrency": 1}))
}

async fn stop_block(Path(id): Path<u32>) -> Json<Value> {
    Json(json!({"ok": true, "block_id": id}))
}

async fn list_primes(State(state): State<Arc<MockState>>) -> Json<Value> {
    Json(Value::Array(state.primes.lock().unwrap().clone()))
}

async fn prime_count(State(state): State<Arc<MockState>>) -> Json<Value> {
    Json(json!({"count": state.primes.lock().unwrap().len()}))
}

async fn submit_run(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if state.reject_runs.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "queue full").into_response();
    }
    let n = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let id = format!("job-{n}");
    state
        .runs
        .lock()
        .unwrap()
        .entry(id.clone())
        .or_insert_with(|| json!({"id": id, "p": body["p"], "status": "queued"}));
    Json(json!({"id": id})).into_response()
}

async fn run_status(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    match state.runs.lock().unwrap().get(&id) {
        Some(run) => Json(run.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn submit_digits(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    let n = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"id": format!("dig-{n}"), "p": body["p"], "estimated_digits": 39}))
}

/// Replays scripted replies in order, then keeps serving the last one.
async fn digits_status(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Json<Value> {
    let mut replies = state.digits_replies.lock().unwrap();
    let reply = if replies.len() > 1 {
        replies.pop_front()
    } else {
        replies.front().cloned()
    };
    Json(reply.unwrap_or_else(|| json!({"id": id, "p": 127, "status": "running"})))
}

async fn download(State(state): State<Arc<MockState>>) -> Vec<u8> {
    state.artifact.lock().unwrap().clone()
}

// ---------------------------------------------------------------------------
// Push channels
// ---------------------------------------------------------------------------

async fn block_channel(
    State(state): State<Arc<MockState>>,
    Path(id): Path<u32>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_channel(state, format!("block/{id}"), socket))
}

async fn job_channel(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_channel(state, format!("job/{id}"), socket))
}

async fn serve_channel(state: Arc<MockState>, key: String, mut socket: WebSocket) {
    state.opened.lock().unwrap().push(key.clone());
    let script = match state.scripts.lock().unwrap().get_mut(&key) {
        Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
        Some(queue) => queue.front().cloned().unwrap_or_default(),
        None => Script::default(),
    };

    for frame in script.frames {
        if !script.gap.is_zero() {
            tokio::time::sleep(script.gap).await;
        }
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
    if script.close_after {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "finished".into(),
            })))
            .await;
    }

    let mut client_close = None;
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Close(frame)) => {
                client_close = frame.map(|f| f.code);
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    state.closed.lock().unwrap().push(Connection { key, client_close });
}
