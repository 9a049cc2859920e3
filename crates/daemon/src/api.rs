//! HTTP API
//!
//! Thin JSON surface over the lifecycle controller. The acting user is taken
//! from the `x-user-id` header; authentication happens upstream.

use crate::controller::LabController;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cyberlab_common::{Error, LabId, UserId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const USER_ID_HEADER: &str = "x-user-id";

const DEFAULT_LOG_TAIL: usize = 100;

type AppState = Arc<LabController>;

/// Build the router
pub fn router(controller: Arc<LabController>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/labs", get(list_labs_handler))
        .route("/api/labs/:id/status", get(lab_status_handler))
        .route("/api/labs/:id/start", post(start_lab_handler))
        .route("/api/labs/:id/stop", post(stop_lab_handler))
        .route("/api/labs/:id/restart", post(restart_lab_handler))
        .route("/api/labs/:id/cleanup", post(cleanup_lab_handler))
        .route("/api/labs/:id/logs", get(lab_logs_handler))
        .route("/api/labs/:id/stats", get(lab_stats_handler))
        .route("/api/system/status", get(system_status_handler))
        .route("/api/system/prune", post(prune_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

/// Serve the API until the listener fails
pub async fn serve(addr: SocketAddr, controller: Arc<LabController>) -> anyhow::Result<()> {
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(controller)).await?;

    Ok(())
}

// ============================================================================
// Response shapes
// ============================================================================

/// `{success: true, message, ...data}`
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    message: String,
    #[serde(flatten)]
    data: T,
}

fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            message: message.into(),
            data,
        }),
    )
        .into_response()
}

/// Failure rendered as `{success: false, message}`
#[derive(Debug)]
pub enum ApiError {
    MissingUser,
    Lab(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Lab(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingUser => StatusCode::UNAUTHORIZED,
            ApiError::Lab(e) => match e {
                Error::NotFound { .. } => StatusCode::NOT_FOUND,
                e if e.is_precondition() => StatusCode::CONFLICT,
                Error::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                e if e.is_compose_failure() => StatusCode::BAD_GATEWAY,
                Error::Runtime(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::MissingUser => format!("Missing or invalid {} header", USER_ID_HEADER),
            ApiError::Lab(e) => e.to_string(),
        };
        if status.is_server_error() {
            warn!("API error ({}): {}", status, message);
        }
        (
            status,
            Json(serde_json::json!({ "success": false, "message": message })),
        )
            .into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

fn acting_user(headers: &HeaderMap) -> std::result::Result<UserId, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<UserId>().ok())
        .ok_or(ApiError::MissingUser)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": cyberlab_common::VERSION,
    }))
}

async fn list_labs_handler(State(controller): State<AppState>) -> ApiResult {
    let labs = controller.get_all_labs_status()?;
    Ok(ok(
        format!("{} labs", labs.len()),
        serde_json::json!({ "labs": labs }),
    ))
}

async fn lab_status_handler(State(controller): State<AppState>, Path(lab_id): Path<LabId>) -> ApiResult {
    let report = controller.get_lab_status(lab_id)?;
    Ok(ok(format!("Lab is {}", report.status), report))
}

async fn start_lab_handler(
    State(controller): State<AppState>,
    Path(lab_id): Path<LabId>,
    headers: HeaderMap,
) -> ApiResult {
    let user_id = acting_user(&headers)?;
    let started = controller.start_lab(lab_id, user_id).await?;
    Ok(ok("Lab started successfully", started))
}

async fn stop_lab_handler(
    State(controller): State<AppState>,
    Path(lab_id): Path<LabId>,
    headers: HeaderMap,
) -> ApiResult {
    let user_id = acting_user(&headers)?;
    controller.stop_lab(lab_id, user_id).await?;
    Ok(ok("Lab stopped successfully", serde_json::json!({ "labId": lab_id })))
}

async fn restart_lab_handler(
    State(controller): State<AppState>,
    Path(lab_id): Path<LabId>,
    headers: HeaderMap,
) -> ApiResult {
    let user_id = acting_user(&headers)?;
    let started = controller.restart_lab(lab_id, user_id).await?;
    Ok(ok("Lab restarted successfully", started))
}

async fn cleanup_lab_handler(
    State(controller): State<AppState>,
    Path(lab_id): Path<LabId>,
    headers: HeaderMap,
) -> ApiResult {
    acting_user(&headers)?;
    controller.clean_up_lab(lab_id).await?;
    Ok(ok("Lab cleaned up", serde_json::json!({ "labId": lab_id })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn lab_logs_handler(
    State(controller): State<AppState>,
    Path(lab_id): Path<LabId>,
    Query(query): Query<LogsQuery>,
) -> ApiResult {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL);
    let logs = controller.get_lab_logs(lab_id, tail).await?;
    Ok(ok(
        format!("Logs from {} containers", logs.len()),
        serde_json::json!({ "logs": logs }),
    ))
}

async fn lab_stats_handler(State(controller): State<AppState>, Path(lab_id): Path<LabId>) -> ApiResult {
    let stats = controller.get_lab_stats(lab_id).await?;
    Ok(ok(
        format!("Stats from {} containers", stats.len()),
        serde_json::json!({ "stats": stats }),
    ))
}

async fn system_status_handler(State(controller): State<AppState>) -> ApiResult {
    let runtime = controller.runtime_overview().await;
    let message = if runtime.available {
        "Container runtime is running"
    } else {
        "Container runtime is not running"
    };
    Ok(ok(
        message,
        serde_json::json!({
            "runtime": runtime,
            "autoRecovery": controller.options().auto_recovery,
        }),
    ))
}

async fn prune_handler(State(controller): State<AppState>, headers: HeaderMap) -> ApiResult {
    acting_user(&headers)?;
    let report = controller.prune_runtime().await?;
    Ok(ok("Unused resources pruned", serde_json::json!({ "pruned": report })))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "success": false, "message": "Not found" })),
    )
}
