use crate::breakpoint::{PendingBreakpoint, UnitEdit};
use crate::engine::InterceptEngine;
use crate::error::EngineError;
use crate::recorder::RecorderStats;
use crate::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Engine counters, shared by every component
#[derive(Debug, Default)]
pub struct Metrics {
    pub units_processed: AtomicU64,
    pub mocks_applied: AtomicU64,
    pub mock_errors: AtomicU64,
    pub breakpoints_suspended: AtomicU64,
    pub breakpoints_timed_out: AtomicU64,
    /// Matched while the pending limit was reached
    pub breakpoints_skipped: AtomicU64,
    pub invalid_transitions: AtomicU64,
    pub chaos_injected: AtomicU64,
    pub rules_rejected: AtomicU64,
    pub store_failures: AtomicU64,
    pub events_recorded: AtomicU64,
    pub events_dropped: AtomicU64,
    pub sink_failures: AtomicU64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub units_processed: u64,
    pub rules: RuleMetrics,
    pub mocks: MockMetrics,
    pub breakpoints: BreakpointMetrics,
    pub chaos_injected: u64,
    pub recorder: RecorderStats,
}

#[derive(Debug, Serialize)]
pub struct RuleMetrics {
    pub rejected: u64,
    pub store_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct MockMetrics {
    pub applied: u64,
    pub errors: u64,
}

#[derive(Debug, Serialize)]
pub struct BreakpointMetrics {
    pub pending: usize,
    pub suspended: u64,
    pub timed_out: u64,
    pub skipped: u64,
    pub invalid_transitions: u64,
}

#[derive(Serialize)]
struct ReleaseResponse {
    id: String,
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Maps engine errors onto HTTP statuses
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidBreakpointTransition { .. } => StatusCode::CONFLICT,
            EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type AppState = Arc<InterceptEngine>;

/// Operator and admin routes
pub fn router(engine: Arc<InterceptEngine>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/breakpoints", get(list_breakpoints))
        .route("/breakpoints/:id", get(get_breakpoint))
        .route("/breakpoints/:id/resume", post(resume_breakpoint))
        .route("/breakpoints/:id/edit", post(edit_breakpoint))
        .route("/breakpoints/:id/cancel", post(cancel_breakpoint))
        .route("/rules/:id/revoke", post(revoke_rule))
        .route("/devices/:device_id/invalidate", post(invalidate_device))
        .with_state(engine)
}

pub async fn start_admin_server(addr: SocketAddr, engine: Arc<InterceptEngine>) -> Result<()> {
    let app = router(engine);
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        EngineError::Configuration(format!("Failed to bind admin address {}: {}", addr, e))
    })?;

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub fn metrics_snapshot(engine: &InterceptEngine) -> MetricsResponse {
    let m = engine.metrics();
    MetricsResponse {
        units_processed: m.units_processed.load(Ordering::Relaxed),
        rules: RuleMetrics {
            rejected: m.rules_rejected.load(Ordering::Relaxed),
            store_failures: m.store_failures.load(Ordering::Relaxed),
        },
        mocks: MockMetrics {
            applied: m.mocks_applied.load(Ordering::Relaxed),
            errors: m.mock_errors.load(Ordering::Relaxed),
        },
        breakpoints: BreakpointMetrics {
            pending: engine.breakpoints().len(),
            suspended: m.breakpoints_suspended.load(Ordering::Relaxed),
            timed_out: m.breakpoints_timed_out.load(Ordering::Relaxed),
            skipped: m.breakpoints_skipped.load(Ordering::Relaxed),
            invalid_transitions: m.invalid_transitions.load(Ordering::Relaxed),
        },
        chaos_injected: m.chaos_injected.load(Ordering::Relaxed),
        recorder: engine.recorder_stats(),
    }
}

async fn metrics_handler(State(engine): State<AppState>) -> Json<MetricsResponse> {
    Json(metrics_snapshot(&engine))
}

async fn list_breakpoints(State(engine): State<AppState>) -> Json<Vec<PendingBreakpoint>> {
    Json(engine.pending_breakpoints())
}

async fn get_breakpoint(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<PendingBreakpoint>, StatusCode> {
    engine.breakpoints().get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn resume_breakpoint(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ReleaseResponse>, ApiError> {
    engine.resume_breakpoint(&id)?;
    Ok(Json(ReleaseResponse {
        id,
        status: "resumed",
    }))
}

async fn edit_breakpoint(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(edit): Json<UnitEdit>,
) -> std::result::Result<Json<ReleaseResponse>, ApiError> {
    engine.resume_with_edits(&id, edit)?;
    Ok(Json(ReleaseResponse {
        id,
        status: "edited",
    }))
}

async fn cancel_breakpoint(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ReleaseResponse>, ApiError> {
    engine.cancel_breakpoint(&id)?;
    Ok(Json(ReleaseResponse {
        id,
        status: "cancelled",
    }))
}

async fn revoke_rule(State(engine): State<AppState>, Path(id): Path<String>) -> StatusCode {
    engine.rule_store().revoke(&id);
    StatusCode::NO_CONTENT
}

async fn invalidate_device(
    State(engine): State<AppState>,
    Path(device_id): Path<String>,
) -> StatusCode {
    engine.rule_store().invalidate(&device_id);
    StatusCode::NO_CONTENT
}
