//! Operator HTTP surface: health, readiness, partition status and resume.

use crate::checkpoint::PartitionId;
use crate::config::ApiConfig;
use crate::supervisor::{PipelineHealth, PipelineSupervisor, SupervisorError};
use crate::worker::PartitionSnapshot;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<PipelineSupervisor>,
    pub service_name: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/partitions", get(list_partitions))
        .route("/partitions/:topic/:partition/resume", post(resume_partition))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness: the process is up and serving
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

/// Readiness: every known partition is making progress
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.supervisor.snapshot();

    if health.shutting_down {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "shutting_down" })),
        );
    }

    if health.parked_partitions > 0 {
        let parked: Vec<String> = health
            .partitions
            .iter()
            .filter(|p| p.parked.is_some())
            .map(|p| format!("{}[{}]", p.topic, p.partition))
            .collect();
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "parked_partitions": parked,
            })),
        );
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ready",
            "partitions": health.partitions.len(),
        })),
    )
}

async fn list_partitions(State(state): State<AppState>) -> Json<PipelineHealth> {
    Json(state.supervisor.snapshot())
}

async fn resume_partition(
    State(state): State<AppState>,
    Path((topic, partition)): Path<(String, i32)>,
) -> Result<Json<PartitionSnapshot>, ApiError> {
    let id = PartitionId::new(topic, partition);
    state.supervisor.resume_partition(&id).map(Json).map_err(|e| {
        warn!(partition = %id, error = %e, "Resume request refused");
        let (status, code) = match &e {
            SupervisorError::UnknownPartition(_) => (StatusCode::NOT_FOUND, "unknown_partition"),
            SupervisorError::NotParked(_) => (StatusCode::CONFLICT, "not_parked"),
            SupervisorError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            SupervisorError::Source(_) => (StatusCode::INTERNAL_SERVER_ERROR, "source_error"),
        };
        (
            status,
            Json(ErrorResponse {
                error: e.to_string(),
                code: code.to_string(),
            }),
        )
    })
}

/// Serve the operator API until `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting operator API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Operation, TenantKey};
    use crate::testing::{event, Harness};
    use serde_json::json;
    use std::time::Duration;

    fn state(harness: &Harness) -> AppState {
        AppState {
            supervisor: Arc::new(PipelineSupervisor::new(
                harness.ctx.clone(),
                CancellationToken::new(),
            )),
            service_name: "tenantflow-pipeline".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ready_when_nothing_is_parked() {
        let harness = Harness::new();
        let response = readiness_check(State(state(&harness))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_parked_partition_fails_readiness_until_resumed() {
        let harness = Harness::new();
        let mut stranger = event(Operation::Create, None, json!({}), "r1");
        stranger.tenant_key = TenantKey::new("B2", "L1");
        harness.push(0, &stranger);

        let state = state(&harness);
        let supervisor = state.supervisor.clone();
        let running = supervisor.clone();
        let task = tokio::spawn(async move { running.run().await });

        for _ in 0..500 {
            if supervisor.snapshot().parked_partitions == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = readiness_check(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let Json(health) = list_partitions(State(state.clone())).await;
        assert_eq!(health.parked_partitions, 1);

        let missing = resume_partition(
            State(state.clone()),
            Path(("tenantflow.mutations".to_string(), 9)),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.0, StatusCode::NOT_FOUND);

        let Json(resumed) = resume_partition(
            State(state.clone()),
            Path(("tenantflow.mutations".to_string(), 0)),
        )
        .await
        .unwrap();
        assert!(resumed.parked.is_none());

        supervisor.shutdown();
        task.await.unwrap();
    }
}
