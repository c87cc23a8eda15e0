/**
 * HTTP API - Thin panel surface over the gateway
 *
 * ROUTES:
 * - /healthz                  liveness, no auth
 * - /api/system/health        uptime, bus state, pending calls, memory
 * - /api/state, /getData      latest telemetry snapshot
 * - /api/cmd, /api/rpc        fire-and-forget and correlated device commands
 * - /api/history              downsampled level chart
 * - /api/telemetry/range      raw rows for replay
 * - /api/devices              device registry
 * - /api/log[/clear|/download] device log cache
 * - /api/live                 server-sent telemetry events
 *
 * SECURITY: everything but /healthz requires `x-api-key` equal to
 * FISHWAY_API_KEY. An unset key denies all access.
 *
 * Device selection: `device_id`, `device` or `dev` query parameter, else the
 * configured default device.
 */

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::devices::DeviceRegistry;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::health::HealthTracker;
use crate::history::Downsampler;
use crate::store::TelemetryStore;
use crate::telemetry::LiveFeed;

pub const ALLOWED_COMMANDS: [&str; 7] =
    ["gate_open", "gate_close", "gate_stop", "auto_on", "auto_off", "auto_latch_off", "manual_end"];

const RANGE_MIN_LIMIT: usize = 50;
const RANGE_MAX_LIMIT: usize = 20_000;
const RANGE_DEFAULT_LIMIT: usize = 2000;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub store: Arc<dyn TelemetryStore>,
    pub devices: Arc<DeviceRegistry>,
    pub history: Arc<Downsampler>,
    pub health: HealthTracker,
    pub live: LiveFeed,
    pub cfg: Arc<GatewayConfig>,
    /// Expected `x-api-key`; `None` locks every protected route.
    pub api_key: Option<Arc<str>>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    ok: bool,
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self { status, ok: false, error: error.into() }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::InvalidRequest(_) | GatewayError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotConnected | GatewayError::Publish(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DeviceMismatch { .. } | GatewayError::DeviceError(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.label())
    }
}

type Params = Query<HashMap<String, String>>;

pub fn build_router(app: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/system/health", get(system_health))
        .route("/api/state", get(get_state))
        .route("/getData", get(get_data))
        .route("/api/cmd", post(post_cmd))
        .route("/api/rpc", post(post_rpc))
        .route("/api/history", get(get_history))
        .route("/api/telemetry/range", get(get_range))
        .route("/api/devices", get(get_devices))
        .route("/api/log", get(get_log))
        .route("/api/log/clear", post(clear_log))
        .route("/api/log/download", get(download_log))
        .route("/api/live", get(live))
        .layer(middleware::from_fn_with_state(app.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/healthz" {
        return Ok(next.run(req).await);
    }
    if !api_key_matches(app.api_key.as_deref(), req.headers()) {
        debug!(path = req.uri().path(), "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn api_key_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected.filter(|k| !k.is_empty()) else {
        return false;
    };
    headers.get("x-api-key").and_then(|v| v.to_str().ok()).is_some_and(|v| v == expected)
}

fn pick_device_id(params: &HashMap<String, String>, default: &str) -> String {
    ["device_id", "device", "dev"]
        .iter()
        .filter_map(|k| params.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Parses an integer parameter, falling back to `default` when absent or
/// unparsable, then clamps it.
fn clamp_param<T>(params: &HashMap<String, String>, key: &str, default: T, min: T, max: T) -> T
where
    T: std::str::FromStr + Ord + Copy,
{
    params.get(key).and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default).clamp(min, max)
}

fn no_store(mut resp: Response) -> Response {
    resp.headers_mut().insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

fn text_response(body: String) -> Response {
    no_store(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// JSON object body, or an empty object when the body is blank.
fn json_body(body: &Bytes) -> Result<serde_json::Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::bad_request("body must be a JSON object")),
        Err(_) => Err(ApiError::bad_request("bad_json")),
    }
}

async fn healthz(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "mqtt": app.gateway.connected() }))
}

async fn system_health(State(app): State<AppState>) -> Response {
    no_store(Json(app.health.report(&app.gateway, &app.devices)).into_response())
}

// GET /api/state
async fn get_state(
    State(app): State<AppState>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let latest = match app.gateway.latest(&device_id) {
        Some(rec) => Some(rec),
        None => app.store.latest(&device_id).map_err(|e| GatewayError::Store(e.to_string()))?,
    };

    let body = json!({
        "ok": true,
        "mqtt_connected": app.gateway.connected(),
        "last_telemetry_at": latest.as_ref().map(|r| r.received_at_ms()),
        "device_id": device_id,
        "telemetry": latest.map(|r| r.payload),
    });
    Ok(no_store(Json(body).into_response()))
}

// GET /getData (legacy panel poll)
async fn get_data(State(app): State<AppState>, Query(params): Params) -> Response {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let payload = app.gateway.latest(&device_id).map(|r| r.payload).unwrap_or_else(|| json!({}));
    no_store(Json(payload).into_response())
}

// POST /api/cmd  {"cmd": "..."} or ?cmd=
async fn post_cmd(
    State(app): State<AppState>,
    Query(params): Params,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let body = json_body(&body)?;
    let cmd = body
        .get("cmd")
        .and_then(Value::as_str)
        .or_else(|| params.get("cmd").map(String::as_str))
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    if !ALLOWED_COMMANDS.contains(&cmd.as_str()) {
        return Err(ApiError::bad_request("bad_cmd"));
    }
    let topic = app.gateway.publish_command(&device_id, &cmd)?;
    Ok(Json(json!({ "ok": true, "device_id": device_id, "cmd": cmd, "topic": topic })))
}

// POST /api/rpc  {"cmd": "...", "timeout_ms"?: n, ...extra}
async fn post_rpc(
    State(app): State<AppState>,
    Query(params): Params,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let mut body = json_body(&body)?;
    let timeout_ms = body.remove("timeout_ms").and_then(|v| v.as_u64());

    let reply = app.gateway.call(&device_id, Value::Object(body), timeout_ms).await?;
    Ok(Json(json!({ "ok": true, "device_id": device_id, "reply": reply })))
}

// GET /api/history?window_s=&max_points=
async fn get_history(
    State(app): State<AppState>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let window_s = params.get("window_s").and_then(|v| v.trim().parse::<i64>().ok());
    let max_points = params
        .get("max_points")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(app.cfg.history.max_points);

    let history = app.history.clone();
    let page = tokio::task::spawn_blocking(move || history.recent(&device_id, window_s, max_points))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(no_store(Json(page).into_response()))
}

// GET /api/telemetry/range?from=&to=&limit=
async fn get_range(
    State(app): State<AppState>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let parse = |key: &str| -> Result<OffsetDateTime, ApiError> {
        let raw = params.get(key).map(|v| v.trim()).unwrap_or_default();
        OffsetDateTime::parse(raw, &Rfc3339)
            .map_err(|_| ApiError::bad_request(format!("bad_{key}")))
    };
    let from = parse("from")?;
    let to = parse("to")?;
    if from >= to {
        return Err(ApiError::bad_request("bad_range"));
    }
    let limit =
        clamp_param(&params, "limit", RANGE_DEFAULT_LIMIT, RANGE_MIN_LIMIT, RANGE_MAX_LIMIT);

    let rows = app
        .store
        .range(&device_id, from, to, limit)
        .map_err(|e| GatewayError::Store(e.to_string()))?;
    let body = json!({ "ok": true, "device_id": device_id, "count": rows.len(), "rows": rows });
    Ok(no_store(Json(body).into_response()))
}

async fn get_devices(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "devices": app.devices.list() }))
}

// GET /api/log?name=&tail_bytes=
async fn get_log(State(app): State<AppState>, Query(params): Params) -> Response {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let name = params.get("name").map(String::as_str).unwrap_or_default();
    let logs = app.gateway.logs();
    let tail_bytes = clamp_param(&params, "tail_bytes", logs.max_bytes(), 0, logs.max_bytes());
    text_response(logs.tail(&device_id, name, tail_bytes))
}

async fn clear_log(State(app): State<AppState>, Query(params): Params) -> Json<Value> {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let name = params.get("name").map(String::as_str).unwrap_or_default();
    app.gateway.logs().clear(&device_id, name);
    Json(json!({ "ok": true }))
}

async fn download_log(State(app): State<AppState>, Query(params): Params) -> Response {
    let device_id = pick_device_id(&params, app.gateway.default_device_id());
    let name = params
        .get("name")
        .map(String::as_str)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or("error");
    let logs = app.gateway.logs();
    let text = logs.tail(&device_id, name, logs.max_bytes());

    let filename: String = format!("{device_id}-{name}.log")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let mut resp = text_response(text);
    if let Ok(v) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        resp.headers_mut().insert(header::CONTENT_DISPOSITION, v);
    }
    resp
}

// GET /api/live (optionally filtered by device)
async fn live(
    State(app): State<AppState>,
    Query(params): Params,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter = ["device_id", "device", "dev"]
        .iter()
        .find_map(|k| params.get(*k))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let rx = app.live.subscribe();

    let events = stream::unfold((rx, filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    if filter.as_deref().is_some_and(|f| f != record.device_id) {
                        continue;
                    }
                    let event = Event::default().event("telemetry").json_data(&record);
                    match event {
                        Ok(event) => return Some((Ok(event), (rx, filter))),
                        Err(e) => warn!("cannot encode live event: {e}"),
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("live subscriber skipped {n} records"),
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}
