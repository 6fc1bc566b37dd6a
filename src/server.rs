use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    config::EngineConfig,
    engine::ScanEngine,
    error::ScanError,
    scanner::SharedProgress,
    types::{HeaderScanReport, HeaderScanRequest, ScanRequest, ScanResult},
};

#[derive(Clone)]
pub struct AppState {
    engine: ScanEngine,
    inner: Arc<RwLock<ServerState>>, // progress of the most recent scan
}

#[derive(Debug, Default)]
struct ServerState {
    progress: Option<SharedProgress>,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            engine: ScanEngine::new(config),
            inner: Arc::new(RwLock::new(ServerState::default())),
        }
    }

    /// Fresh progress counters, published as the most recent scan.
    async fn begin(&self) -> SharedProgress {
        let progress = SharedProgress::new();
        self.inner.write().await.progress = Some(progress.clone());
        progress
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub total: u64,
    pub scanned: u64,
    pub open: u64,
    pub state: String, // "idle" or the current scan phase
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub message: String,
}

/// Scan errors and unreadable request bodies as HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    Scan(ScanError),
    Body(JsonRejection),
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        Self::Scan(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::Body(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            Self::Scan(err) => err,
            Self::Body(rejection) => {
                return error_response(rejection.status(), "invalid_body", rejection.body_text());
            }
        };
        let (status, key) = match &err {
            ScanError::InvalidTarget(_) => (StatusCode::BAD_REQUEST, "invalid_target"),
            ScanError::InvalidPortRange(_) => (StatusCode::BAD_REQUEST, "invalid_port_range"),
            ScanError::UnresolvableTarget { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unresolvable_target")
            }
            ScanError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ScanError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = match &err {
            ScanError::Internal(details) => {
                // Keep internals out of the response body.
                error!(details = %details, "internal server error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        error_response(status, key, message)
    }
}

fn error_response(status: StatusCode, key: &str, message: String) -> Response {
    (
        status,
        Json(ApiErrorBody {
            error: key.into(),
            message,
        }),
    )
        .into_response()
}

/// Build the API router. Everything lives under `/api`.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/scan_ports", post(post_scan_ports))
        .route("/scan", post(post_scan_headers))
        .route("/scan/", post(post_scan_headers))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub async fn spawn_server(bind: &str, config: EngineConfig) -> Result<()> {
    let app = build_router(AppState::new(config));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving API");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let out = match s.progress.as_ref() {
        Some(p) => Status {
            total: p.total(),
            scanned: p.done(),
            open: p.open(),
            state: p.phase().to_string(),
        },
        None => Status {
            total: 0,
            scanned: 0,
            open: 0,
            state: "idle".into(),
        },
    };
    (StatusCode::OK, Json(out))
}

// Scans run on their own task. If the client goes away the handler future is
// dropped along with the guard, which cancels the scan.
async fn post_scan_ports(
    State(app): State<AppState>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Json<ScanResult>, ApiError> {
    let Json(req) = payload?;
    let progress = app.begin().await;
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let engine = app.engine.clone();
    let task = tokio::spawn(async move { engine.scan(&req, cancel, &progress).await });
    let res = task
        .await
        .map_err(|e| ScanError::Internal(format!("scan task failed: {e}")))?;
    guard.disarm();
    Ok(Json(res?))
}

async fn post_scan_headers(
    State(app): State<AppState>,
    payload: Result<Json<HeaderScanRequest>, JsonRejection>,
) -> Result<Json<HeaderScanReport>, ApiError> {
    let Json(req) = payload?;
    let progress = app.begin().await;
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let engine = app.engine.clone();
    let task =
        tokio::spawn(async move { engine.scan_headers(&req.target, cancel, &progress).await });
    let res = task
        .await
        .map_err(|e| ScanError::Internal(format!("header scan task failed: {e}")))?;
    guard.disarm();
    Ok(Json(res?))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(err: ScanError) -> (StatusCode, serde_json::Value) {
        let resp = ApiError::Scan(err).into_response();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn maps_scan_errors_to_statuses() {
        let (status, body) = body_of(ScanError::InvalidPortRange("1-".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_port_range");

        let (status, _) = body_of(ScanError::UnresolvableTarget {
            target: "x.invalid".into(),
            reason: "no records".into(),
        })
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = body_of(ScanError::Timeout).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn hides_internal_details() {
        let (status, body) = body_of(ScanError::Internal("secret path /etc".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "internal server error");
    }
}
