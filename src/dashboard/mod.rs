use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::collector::{ReportSummary, RunReport};
use crate::error::BenchError;
use crate::publisher::ReportHistory;
use crate::scheduler::{WorkerInfo, WorkerPool, WorkerRegistration};
use crate::trigger::{LoopStatus, TriggerHandle, TriggerResponse, TriggerSource};

#[derive(Clone)]
pub struct DashboardState {
    pub trigger: TriggerHandle,
    pub pool: Arc<WorkerPool>,
    pub history: Arc<ReportHistory>,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    trigger: LoopStatus,
    workers: usize,
    total_load: u32,
    available_capacity: u32,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/runs", post(trigger_handler))
        .route("/api/reports", get(list_reports_handler))
        .route("/api/reports/latest", get(latest_report_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers", post(register_worker_handler))
        .route("/api/workers/:id", delete(deregister_worker_handler))
        .route("/api/workers/:id/heartbeat", post(heartbeat_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting admin API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind admin API");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Admin API failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        trigger: state.trigger.status(),
        workers: state.pool.len(),
        total_load: state.pool.total_load(),
        available_capacity: state.pool.available_capacity(),
    })
}

async fn trigger_handler(State(state): State<DashboardState>) -> Response {
    match state.trigger.trigger(TriggerSource::Manual).await {
        Ok(response) => {
            let status = match response {
                TriggerResponse::Started { .. } | TriggerResponse::Queued { .. } => {
                    StatusCode::ACCEPTED
                }
                TriggerResponse::Coalesced { .. } => StatusCode::CONFLICT,
                TriggerResponse::Halted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(response)).into_response()
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn list_reports_handler(State(state): State<DashboardState>) -> Json<Vec<ReportSummary>> {
    Json(state.history.all().iter().map(RunReport::summary).collect())
}

async fn latest_report_handler(State(state): State<DashboardState>) -> Response {
    match state.history.latest() {
        Some(report) => Json(report).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no run has been published yet"),
    }
}

async fn list_workers_handler(State(state): State<DashboardState>) -> Json<Vec<WorkerInfo>> {
    Json(state.pool.workers())
}

async fn register_worker_handler(
    State(state): State<DashboardState>,
    Json(registration): Json<WorkerRegistration>,
) -> Response {
    let worker_id = registration.id;
    match state.pool.register(registration) {
        Ok(()) => match state.pool.worker(worker_id) {
            Some(info) => (StatusCode::CREATED, Json(info)).into_response(),
            None => error_response(StatusCode::INTERNAL_SERVER_ERROR, "worker vanished"),
        },
        Err(e @ BenchError::WorkerExists(_)) => error_response(StatusCode::CONFLICT, e),
        Err(e @ BenchError::ZeroCapacity(_)) => error_response(StatusCode::BAD_REQUEST, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn deregister_worker_handler(
    State(state): State<DashboardState>,
    Path(worker_id): Path<u64>,
) -> Response {
    match state.pool.deregister(worker_id) {
        Ok(info) => Json(info).into_response(),
        Err(e @ BenchError::WorkerNotFound(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn heartbeat_handler(
    State(state): State<DashboardState>,
    Path(worker_id): Path<u64>,
) -> Response {
    match state.pool.heartbeat(worker_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ BenchError::WorkerNotFound(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
