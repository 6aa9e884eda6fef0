use crate::collectors::processes::ProcessAttributor;
use crate::collectors::refresh_processes;
use crate::config::{Mode, WidgetConfig};
use crate::metrics::Metrics;
use crate::relay::{GpuStatus, RelayClient};
use crate::state::{now_unix_ms, GpuProcessEntry, SharedState, SnapshotEntry, SupervisorState};
use crate::widget::{self, Summary, WidgetPayload};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<SharedState>,
    pub attributor: Arc<ProcessAttributor>,
    pub widget: Arc<WidgetConfig>,
    pub relay: Option<RelayClient>,
}

#[derive(Debug, Serialize)]
pub struct FeedEnvelope<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub available: bool,
    pub timestamp: Option<i64>,
    pub data: Option<&'a Value>,
    pub processes: &'a [GpuProcessEntry],
}

impl<'a> FeedEnvelope<'a> {
    pub fn new(
        kind: &'static str,
        entry: &'a SnapshotEntry,
        processes: &'a [GpuProcessEntry],
    ) -> Self {
        Self {
            kind,
            available: entry.available,
            timestamp: entry.timestamp_ms,
            data: entry.data.as_deref(),
            processes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProcessesResponse {
    pub available: bool,
    pub processes: Vec<GpuProcessEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<SupervisorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_spawns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_server: Option<String>,
}

pub fn build_router(app: HttpAppState, mode: Mode) -> Router {
    let router = match mode {
        Mode::Embedded => Router::new()
            .route("/", get(index_handler))
            .route("/ws", get(ws_handler))
            .route("/api/gpu", get(gpu_handler))
            .route("/api/processes", get(processes_handler))
            .route("/widgets/gpu", get(widget_handler))
            .route("/health", get(health_handler)),
        Mode::Relay => Router::new()
            .route("/widgets/gpu", get(relay_widget_handler))
            .route("/health", get(relay_health_handler)),
    };
    router
        .route("/metrics", get(metrics_handler))
        .with_state(app)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn ws_handler(ws: WebSocketUpgrade, State(app): State<HttpAppState>) -> Response {
    ws.on_upgrade(move |socket| push_feed(socket, app))
}

async fn push_feed(mut socket: WebSocket, app: HttpAppState) {
    info!("push client connected");
    let mut rx = app.state.subscribe();

    let entry = rx.borrow_and_update().clone();
    if send_envelope(&mut socket, "status", &entry, &app.state).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let entry = rx.borrow_and_update().clone();
                if send_envelope(&mut socket, "gpu_data", &entry, &app.state).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(error = %err, "push client error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    info!("push client disconnected");
}

async fn send_envelope(
    socket: &mut WebSocket,
    kind: &'static str,
    entry: &SnapshotEntry,
    state: &SharedState,
) -> Result<(), axum::Error> {
    let processes = state.processes();
    let text = match serde_json::to_string(&FeedEnvelope::new(kind, entry, &processes)) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to encode push envelope");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await
}

async fn gpu_handler(State(app): State<HttpAppState>) -> Json<GpuStatus> {
    let entry = app.state.snapshot();
    Json(GpuStatus {
        available: entry.available,
        timestamp: entry.timestamp_ms,
        data: entry.data.as_deref().cloned(),
    })
}

async fn processes_handler(State(app): State<HttpAppState>) -> Json<ProcessesResponse> {
    if !app.state.is_available() {
        return Json(ProcessesResponse {
            available: false,
            processes: Vec::new(),
            count: None,
        });
    }

    let processes = refresh_processes(&app.attributor, &app.state, &app.metrics).await;
    Json(ProcessesResponse {
        available: true,
        count: Some(processes.len()),
        processes: processes.as_ref().clone(),
    })
}

async fn widget_handler(State(app): State<HttpAppState>) -> Json<WidgetPayload> {
    let entry = app.state.snapshot();
    let summary = match (&entry.data, entry.available) {
        (Some(data), true) => Some(Summary::from_snapshot(data)),
        _ => None,
    };
    Json(widget::render(&app.widget, summary))
}

async fn health_handler(State(app): State<HttpAppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        gpu_available: Some(app.state.is_available()),
        timestamp: Some(now_unix_ms()),
        monitor: Some(app.state.supervisor_state()),
        monitor_spawns: Some(app.state.spawn_count()),
        main_server: None,
    })
}

async fn relay_widget_handler(State(app): State<HttpAppState>) -> Json<WidgetPayload> {
    let Some(relay) = &app.relay else {
        return Json(widget::render(&app.widget, None));
    };

    let summary = match relay.fetch_status().await {
        Ok(status) => match (status.available, status.data) {
            (true, Some(data)) => Some(Summary::from_snapshot(&data)),
            _ => {
                debug!("upstream reports GPU unavailable");
                None
            }
        },
        Err(err) => {
            warn!(error = %err, upstream = relay.gpu_url(), "relay request failed");
            app.metrics.inc_relay_error();
            None
        }
    };
    Json(widget::render(&app.widget, summary))
}

async fn relay_health_handler(State(app): State<HttpAppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        gpu_available: None,
        timestamp: None,
        monitor: None,
        monitor_spawns: None,
        main_server: app.relay.as_ref().map(|r| r.gpu_url().to_string()),
    })
}

async fn metrics_handler(State(app): State<HttpAppState>) -> Response {
    app.metrics.inc_scrape_count();
    app.metrics.update_uptime(&app.state);
    match app.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}
