use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, Extension, Path},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use devhub_core::{CommandRequest, Hub, HubError, PeerId, PeerRegistration};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::{
    auth::{ApiTokens, TokenRejection},
    config::HttpConfig,
    ws,
};

#[derive(Clone)]
struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    hub: Arc<Hub>,
    tokens: ApiTokens,
}

impl HttpState {
    fn new(hub: Arc<Hub>, tokens: ApiTokens) -> Self {
        Self {
            inner: Arc::new(HttpStateInner { hub, tokens }),
        }
    }

    fn ensure_authorized(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        self.inner.tokens.check(headers).map_err(|rejection| {
            debug!(%rejection, "Operator request rejected");
            ApiError::Unauthorized(rejection)
        })
    }

    fn hub(&self) -> &Arc<Hub> {
        &self.inner.hub
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(TokenRejection),
    BadRequest(String),
    NotImplemented(&'static str),
    Hub(HubError),
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError::Hub(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(rejection) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "reason": rejection.to_string(),
                    "code": "E_UNAUTHORIZED",
                })),
            )
                .into_response(),
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": detail, "code": "E_BAD_REQUEST" })),
            )
                .into_response(),
            ApiError::NotImplemented(detail) => (
                StatusCode::NOT_IMPLEMENTED,
                Json(json!({ "error": detail, "code": "E_UNSUPPORTED" })),
            )
                .into_response(),
            ApiError::Hub(err) => {
                let status = hub_status(&err);
                if status.is_server_error() {
                    error!(code = err.code(), "Request failed: {err}");
                }
                (
                    status,
                    Json(json!({ "error": err.to_string(), "code": err.code() })),
                )
                    .into_response()
            }
        }
    }
}

fn hub_status(err: &HubError) -> StatusCode {
    match err {
        HubError::UnknownPeer(_) | HubError::UnknownTask(_) => StatusCode::NOT_FOUND,
        HubError::PeerNotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
        HubError::DuplicateRequestId(_) => StatusCode::CONFLICT,
        HubError::TransportWriteFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        HubError::AuthTimeout | HubError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        HubError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
    }
}

/// Serves the API until `shutdown` resolves.
pub async fn run_http_server<F>(hub: Arc<Hub>, config: HttpConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(hub, &config);

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address()))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind devhub HTTP server to {addr}"))?;

    info!("devhub HTTP server listening on {addr}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server encountered an unrecoverable error")?;

    Ok(())
}

fn build_router(hub: Arc<Hub>, config: &HttpConfig) -> Router {
    let tokens = ApiTokens::new(&config.tokens);
    if tokens.is_open() {
        info!("API bearer authentication disabled (no tokens configured)");
    }
    let state = HttpState::new(hub, tokens);

    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/register", post(register_device))
        .route("/api/devices/screenshot", post(local_screenshot))
        .route("/api/devices/:device_id/execute", post(execute_command))
        .route("/api/devices/:device_id/screenshot", post(request_screenshot))
        .route("/api/screenshots/:request_id", get(read_screenshot))
        .route("/ws/device/:device_id", get(device_socket))
        .layer(Extension(state))
        .layer(build_cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http())
}

async fn root() -> impl IntoResponse {
    Json(json!({ "message": "Device Automation Server is running" }))
}

async fn health(Extension(state): Extension<HttpState>) -> impl IntoResponse {
    let health = state.hub().health();
    Json(json!({
        "status": "healthy",
        "devices_connected": health.devices_connected,
        "devices_registered": health.devices_registered,
        "tasks_tracked": health.tasks_tracked,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "version": env!("CARGO_PKG_VERSION"),
        "build": devhub_build_info::build_id(),
    }))
}

async fn register_device(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(registration): Json<PeerRegistration>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers)?;

    if registration.name.trim().is_empty() {
        return Err(ApiError::BadRequest("device_name must not be empty".into()));
    }

    let registered = state.hub().register_peer(registration);
    Ok((StatusCode::OK, Json(registered)).into_response())
}

async fn list_devices(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers)?;

    let devices = state.hub().list_peers();
    let total = devices.len();
    Ok(Json(json!({ "devices": devices, "total": total })).into_response())
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    command_id: Option<String>,
    action: String,
    target: Option<Value>,
    parameters: Option<Value>,
}

async fn execute_command(
    Extension(state): Extension<HttpState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers)?;

    if body.action.trim().is_empty() {
        return Err(ApiError::BadRequest("action must not be empty".into()));
    }

    let peer_id = PeerId::from(device_id);
    let request = CommandRequest {
        command_id: body.command_id,
        action: body.action,
        target: body.target,
        parameters: body.parameters,
    };
    let command_id = state.hub().dispatch_command(&peer_id, request).await?;

    Ok(Json(json!({
        "command_id": command_id,
        "status": "sent",
        "device_id": peer_id,
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ScreenshotBody {
    request_id: Option<String>,
    parameters: Option<Value>,
}

/// The body is optional, so it is parsed by hand rather than through `Json`.
async fn request_screenshot(
    Extension(state): Extension<HttpState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers)?;

    let body: ScreenshotBody = if body.iter().all(u8::is_ascii_whitespace) {
        ScreenshotBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::BadRequest(format!("invalid screenshot request: {err}")))?
    };

    let peer_id = PeerId::from(device_id);
    let task = state
        .hub()
        .open_screenshot_task(&peer_id, body.request_id, body.parameters)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "request_id": task.request_id,
            "status": task.state,
            "device_id": task.peer_id,
        })),
    )
        .into_response())
}

async fn read_screenshot(
    Extension(state): Extension<HttpState>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers)?;

    let task = state.hub().read_screenshot_task(&request_id)?;
    Ok(Json(task).into_response())
}

async fn local_screenshot(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers)?;
    Err(ApiError::NotImplemented(
        "server-side capture is not available; request a screenshot from a connected device",
    ))
}

async fn device_socket(
    Extension(state): Extension<HttpState>,
    Path(device_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let hub = Arc::clone(state.hub());
    let peer_id = PeerId::from(device_id);

    upgrade.on_upgrade(move |socket| async move {
        let (outbound, inbound, writer) = ws::split(socket);
        let report = hub.serve_connection(peer_id, outbound, inbound).await;
        debug!(
            peer_id = %report.peer_id,
            authenticated = report.authenticated,
            replies_routed = report.replies_routed,
            replies_dropped = report.replies_dropped,
            reason = %report.reason,
            "Device socket finished"
        );
        let _ = writer.await;
    })
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}
