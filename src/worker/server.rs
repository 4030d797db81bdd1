use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, routing::post, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::scheduler::AttemptOutcome;
use crate::worker::executor::{AgentRunner, InvocationRequest};

#[derive(Clone)]
pub struct AgentState {
    pub runner: Arc<AgentRunner>,
    /// Cancelling it stops every job the agent is running.
    pub shutdown: CancellationToken,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    shell: String,
}

/// Routes served by a remote agent. If the scheduler drops the request, the
/// handler future is dropped and the benchmark's process group with it.
pub fn agent_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .with_state(state)
}

pub async fn run_agent(addr: SocketAddr, state: AgentState, shutdown: CancellationToken) {
    let app = agent_router(state);

    tracing::info!(addr = %addr, "Starting agent server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind agent server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Agent server failed");
    }
}

async fn health_handler(State(state): State<AgentState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        shell: state.runner.config().shell.clone(),
    })
}

async fn run_handler(
    State(state): State<AgentState>,
    Json(mut request): Json<InvocationRequest>,
) -> Json<AttemptOutcome> {
    // An agent never forwards again
    request.worker_endpoint = None;
    tracing::info!(
        job_id = %request.job_id,
        job = %request.job_name,
        attempt = request.attempt,
        "Agent received job"
    );
    let outcome = state
        .runner
        .execute_local(&request, state.shutdown.child_token())
        .await;
    Json(outcome)
}
