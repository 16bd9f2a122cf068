//! Job routes: one-off messages with a single expected agent reply.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::error::ApiError;
use crate::validate;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/health", get(jobs_health))
        .route("/:job_id", get(get_job))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobBody {
    agent_id: String,
    user_id: String,
    content: String,
    #[serde(default)]
    timeout_ms: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobBody>,
) -> Result<Response, ApiError> {
    let agent_id = validate::parse_id("agentId", &body.agent_id)?;
    let user_id = validate::parse_id("userId", &body.user_id)?;

    let job = state
        .jobs
        .create(agent_id, user_id, body.content, body.timeout_ms, body.metadata)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": { "job": job } })),
    )
        .into_response())
}

async fn list_jobs(State(state): State<AppState>) -> Json<Value> {
    let jobs = state.jobs.list();
    let total = jobs.len();
    Json(json!({
        "success": true,
        "data": { "jobs": jobs, "total": total },
    }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job_id = validate::parse_id("jobId", &job_id)?;
    let job = state.jobs.get(job_id)?;
    Ok(Json(json!({ "success": true, "data": { "job": job } })))
}

async fn jobs_health(State(state): State<AppState>) -> Json<Value> {
    Json(state.jobs.health())
}
