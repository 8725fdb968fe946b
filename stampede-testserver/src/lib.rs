use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep};

pub const PATH_HEALTH: &str = "/health";
pub const PATH_TASKS: &str = "/api/v1/tasks";
pub const PATH_TASK: &str = "/api/v1/tasks/{id}";
pub const PATH_METRICS: &str = "/metrics";
pub const PATH_LOGIN: &str = "/auth/login";
pub const PATH_SLOW: &str = "/slow";
pub const PATH_FAIL: &str = "/fail";
pub const PATH_WS: &str = "/ws/connect";

pub const TEST_USERNAME: &str = "loadtest@example.com";
pub const TEST_PASSWORD: &str = "loadtest";
pub const TEST_TOKEN: &str = "test-access-token";

#[derive(Debug, Clone, Default)]
pub struct TestServerStats {
    requests_total: Arc<AtomicU64>,
    bearer_requests: Arc<AtomicU64>,
    tasks_created: Arc<AtomicU64>,
    logins_failed: Arc<AtomicU64>,
    ws_connections: Arc<AtomicU64>,
    ws_pings: Arc<AtomicU64>,
    ws_closed: Arc<AtomicU64>,
}

impl TestServerStats {
    fn observe(&self, headers: &HeaderMap) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TEST_TOKEN}"))
        {
            self.bearer_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Requests that carried `Authorization: Bearer <TEST_TOKEN>`.
    pub fn bearer_requests(&self) -> u64 {
        self.bearer_requests.load(Ordering::Relaxed)
    }

    pub fn tasks_created(&self) -> u64 {
        self.tasks_created.load(Ordering::Relaxed)
    }

    pub fn logins_failed(&self) -> u64 {
        self.logins_failed.load(Ordering::Relaxed)
    }

    pub fn ws_connections(&self) -> u64 {
        self.ws_connections.load(Ordering::Relaxed)
    }

    pub fn ws_pings(&self) -> u64 {
        self.ws_pings.load(Ordering::Relaxed)
    }

    pub fn ws_closed(&self) -> u64 {
        self.ws_closed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct TestServerUrls {
    pub base_url: String,
    pub health: String,
    pub tasks: String,
    pub metrics: String,
    pub login: String,
    pub slow: String,
    pub fail: String,
    pub ws: String,
}

impl TestServerUrls {
    pub fn new(addr: SocketAddr) -> Self {
        let base_url = format!("http://{addr}");
        Self {
            health: format!("{base_url}{PATH_HEALTH}"),
            tasks: format!("{base_url}{PATH_TASKS}"),
            metrics: format!("{base_url}{PATH_METRICS}"),
            login: format!("{base_url}{PATH_LOGIN}"),
            slow: format!("{base_url}{PATH_SLOW}"),
            fail: format!("{base_url}{PATH_FAIL}"),
            ws: format!("ws://{addr}{PATH_WS}"),
            base_url,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Task {
    id: u64,
    titulo: String,
    descripcion: String,
    prioridad: String,
    estado: String,
}

#[derive(Debug, Deserialize)]
struct NewTask {
    titulo: String,
    #[serde(default)]
    descripcion: String,
    #[serde(default = "default_priority")]
    prioridad: String,
    #[serde(default = "default_state")]
    estado: String,
}

fn default_priority() -> String {
    "media".to_string()
}

fn default_state() -> String {
    "pendiente".to_string()
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct SlowQuery {
    #[serde(default = "default_slow_ms")]
    ms: u64,
}

fn default_slow_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: Option<String>,
    user_role: Option<String>,
    #[serde(default)]
    ack_delay_ms: u64,
    /// `false` keeps the connection open without ever acknowledging it.
    #[serde(default = "default_ack")]
    ack: bool,
}

fn default_ack() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
struct AppState {
    stats: TestServerStats,
    tasks: Arc<Mutex<BTreeMap<u64, Task>>>,
    next_task_id: Arc<AtomicU64>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn handle_health(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    state.stats.observe(&headers);
    Json(json!({ "status": "ok" }))
}

async fn handle_list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    state.stats.observe(&headers);
    let tasks = state.tasks.lock().unwrap_or_else(|e| e.into_inner());
    let items: Vec<&Task> = tasks.values().skip(query.skip).take(query.limit).collect();
    Json(json!({ "items": items, "total": tasks.len() }))
}

async fn handle_create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewTask>,
) -> (StatusCode, Json<Task>) {
    state.stats.observe(&headers);
    let id = state.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
    let task = Task {
        id,
        titulo: new.titulo,
        descripcion: new.descripcion,
        prioridad: new.prioridad,
        estado: new.estado,
    };
    state
        .tasks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, task.clone());
    state.stats.tasks_created.fetch_add(1, Ordering::Relaxed);
    (StatusCode::CREATED, Json(task))
}

async fn handle_get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    state.stats.observe(&headers);
    let task = state
        .tasks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&id)
        .cloned();
    match task {
        Some(task) => Json(task).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "detail": "not found" }))).into_response(),
    }
}

async fn handle_metrics(State(state): State<AppState>, headers: HeaderMap) -> String {
    state.stats.observe(&headers);
    let stats = &state.stats;
    format!(
        "# HELP http_requests_total Requests served.\n\
         # TYPE http_requests_total counter\n\
         http_requests_total {}\n\
         # HELP tasks_created_total Tasks created.\n\
         # TYPE tasks_created_total counter\n\
         tasks_created_total {}\n\
         # HELP ws_connections_total WebSocket connections accepted.\n\
         # TYPE ws_connections_total counter\n\
         ws_connections_total {}\n",
        stats.requests_total(),
        stats.tasks_created(),
        stats.ws_connections(),
    )
}

async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Response {
    state.stats.observe(&headers);
    if req.username == TEST_USERNAME && req.password == TEST_PASSWORD {
        Json(json!({ "access_token": TEST_TOKEN, "token_type": "bearer" })).into_response()
    } else {
        state.stats.logins_failed.fetch_add(1, Ordering::Relaxed);
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "invalid credentials" })),
        )
            .into_response()
    }
}

async fn handle_slow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SlowQuery>,
) -> &'static str {
    state.stats.observe(&headers);
    sleep(Duration::from_millis(query.ms)).await;
    "slow"
}

async fn handle_fail(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    state.stats.observe(&headers);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn handle_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let id = state.stats.ws_connections.fetch_add(1, Ordering::Relaxed) + 1;
    ws.on_upgrade(move |socket| ws_session(socket, state.stats, query, id))
}

async fn ws_session(mut socket: WebSocket, stats: TestServerStats, query: WsQuery, id: u64) {
    if query.ack {
        sleep(Duration::from_millis(query.ack_delay_ms)).await;
        let ack = json!({
            "event_type": "CONNECTION_ACK",
            "timestamp": now_millis(),
            "data": {
                "connection_id": format!("conn-{id}"),
                "user_id": query.user_id,
                "user_role": query.user_role,
            },
        });
        if socket.send(Message::Text(ack.to_string().into())).await.is_err() {
            stats.ws_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let is_ping = serde_json::from_str::<Value>(text.as_str())
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "ping"))
                    .unwrap_or(false);
                if is_ping {
                    stats.ws_pings.fetch_add(1, Ordering::Relaxed);
                    let pong = json!({ "event_type": "PONG", "timestamp": now_millis() });
                    if socket.send(Message::Text(pong.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    stats.ws_closed.fetch_add(1, Ordering::Relaxed);
}

pub fn router(stats: TestServerStats) -> Router {
    let state = AppState {
        stats,
        ..AppState::default()
    };
    Router::new()
        .route(PATH_HEALTH, get(handle_health))
        .route(PATH_TASKS, get(handle_list_tasks).post(handle_create_task))
        .route(PATH_TASK, get(handle_get_task))
        .route(PATH_METRICS, get(handle_metrics))
        .route(PATH_LOGIN, post(handle_login))
        .route(PATH_SLOW, get(handle_slow))
        .route(PATH_FAIL, get(handle_fail))
        .route(PATH_WS, get(handle_ws))
        .with_state(state)
}

/// In-process system under test for end-to-end tests.
pub struct TestServer {
    addr: SocketAddr,
    urls: TestServerUrls,
    stats: TestServerStats,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let stats = TestServerStats::default();
        let app = router(stats.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(Self {
            addr,
            urls: TestServerUrls::new(addr),
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> &str {
        &self.urls.base_url
    }

    pub fn urls(&self) -> &TestServerUrls {
        &self.urls
    }

    pub fn stats(&self) -> &TestServerStats {
        &self.stats
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some()
            && let Some(task) = self.task.take()
        {
            task.abort();
        }
    }
}
