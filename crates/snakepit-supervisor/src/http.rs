use std::path::PathBuf;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use snakepit_worker::{AgentId, WorkerInfo, WorkerStatus};

use crate::error::{ErrorPayload, SupervisorError};
use crate::supervisor::Supervisor;

#[derive(Debug, Deserialize)]
pub struct ArtifactRequest {
    pub artifact_path: PathBuf,
    /// Defaults to the artifact's extension.
    #[serde(default)]
    pub language: Option<String>,
}

impl ArtifactRequest {
    fn language(&self) -> String {
        self.language.clone().unwrap_or_else(|| {
            self.artifact_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_string()
        })
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    managed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub agent_id: AgentId,
    pub status: WorkerStatus,
}

#[derive(Debug)]
pub enum ApiError {
    Supervisor(SupervisorError),
    NotFound(AgentId),
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        Self::Supervisor(err)
    }
}

pub fn status_for(err: &SupervisorError) -> StatusCode {
    match err.code() {
        "unsupported_language" | "language_mismatch" => StatusCode::BAD_REQUEST,
        "ports_exhausted" | "closed" => StatusCode::SERVICE_UNAVAILABLE,
        "compile_failed" => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Supervisor(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::warn!(code = err.code(), %err, "request failed");
                }
                (status, Json(ErrorPayload::from(&err))).into_response()
            }
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(ErrorPayload {
                    code: "not_found".to_string(),
                    message: format!("agent {id} is not managed"),
                    hint: None,
                }),
            )
                .into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/agents", get(list_agents))
        .route(
            "/agents/:id",
            put(manage_agent).get(get_agent).delete(remove_agent),
        )
        .route("/agents/:id/status", get(agent_status))
        .route("/agents/:id/stop", post(stop_agent))
        .route("/agents/:id/rerun", post(rerun_agent))
        .route("/agents/:id/ensure", post(ensure_agent))
        .with_state(supervisor)
}

async fn healthz(State(sup): State<Supervisor>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        managed: sup.list().len(),
    })
}

async fn list_agents(State(sup): State<Supervisor>) -> Json<Vec<WorkerInfo>> {
    Json(sup.list())
}

async fn manage_agent(
    State(sup): State<Supervisor>,
    Path(id): Path<i64>,
    Json(req): Json<ArtifactRequest>,
) -> ApiResult<Json<WorkerInfo>> {
    let id = AgentId(id);
    sup.manage(id, &req.artifact_path, &req.language()).await?;
    // A failed health check may have evicted it in between.
    sup.get_server(id).map(Json).ok_or(ApiError::NotFound(id))
}

async fn get_agent(
    State(sup): State<Supervisor>,
    Path(id): Path<i64>,
) -> ApiResult<Json<WorkerInfo>> {
    let id = AgentId(id);
    sup.get_server(id).map(Json).ok_or(ApiError::NotFound(id))
}

async fn agent_status(State(sup): State<Supervisor>, Path(id): Path<i64>) -> Json<StatusResponse> {
    let agent_id = AgentId(id);
    let status = sup.get_status(agent_id).await;
    Json(StatusResponse { agent_id, status })
}

async fn stop_agent(State(sup): State<Supervisor>, Path(id): Path<i64>) -> StatusCode {
    sup.stop(AgentId(id)).await;
    StatusCode::NO_CONTENT
}

async fn remove_agent(State(sup): State<Supervisor>, Path(id): Path<i64>) -> StatusCode {
    sup.stop_and_remove(AgentId(id)).await;
    StatusCode::NO_CONTENT
}

async fn rerun_agent(
    State(sup): State<Supervisor>,
    Path(id): Path<i64>,
    Json(req): Json<ArtifactRequest>,
) -> ApiResult<Json<WorkerInfo>> {
    let info = sup
        .rerun(AgentId(id), &req.artifact_path, &req.language())
        .await?;
    Ok(Json(info))
}

async fn ensure_agent(
    State(sup): State<Supervisor>,
    Path(id): Path<i64>,
    Json(req): Json<ArtifactRequest>,
) -> ApiResult<Json<WorkerInfo>> {
    let info = sup
        .ensure_running(AgentId(id), &req.artifact_path, &req.language())
        .await?;
    Ok(Json(info))
}
