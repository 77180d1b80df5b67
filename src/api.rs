//! REST endpoints for task submission, task reads and scheduler control.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::plan::{TaskFilter, TaskStatus};
use crate::scheduler::Scheduler;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Build the Axum router with the task and scheduler routes.
pub fn routes(scheduler: Arc<Scheduler>) -> Router {
    let state = AppState { scheduler };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/scheduler", get(scheduler_status))
        .route("/api/scheduler/tick", post(tick))
        .route("/api/agents", get(agents))
        .route("/api/tools", get(tools))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "scan-orchestrator"
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default = "default_owner")]
    owner: String,
    #[serde(default)]
    instruction: String,
    plan: Vec<Value>,
}

fn default_owner() -> String {
    "default".to_string()
}

async fn submit_task(State(state): State<AppState>, Json(body): Json<SubmitRequest>) -> impl IntoResponse {
    match state
        .scheduler
        .submit(&body.owner, &body.instruction, &body.plan)
        .await
    {
        Ok(task) => (StatusCode::CREATED, Json(serde_json::json!(task))),
        Err(Error::Validation(e)) => {
            info!(error = %e, "Rejected plan");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    owner: Option<String>,
    limit: Option<usize>,
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListQuery>) -> impl IntoResponse {
    let statuses = match query.status.as_deref() {
        None => None,
        Some(raw) => match TaskStatus::parse(raw) {
            Some(status) => Some(vec![status]),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("Unknown task status: {raw}")})),
                );
            }
        },
    };
    let filter = TaskFilter {
        statuses,
        owner: query.owner,
        limit: query.limit,
    };

    match state.scheduler.list(&filter).await {
        Ok(tasks) => (StatusCode::OK, Json(serde_json::json!(tasks))),
        Err(e) => internal_error(e),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid task ID"})),
            );
        }
    };

    match state.scheduler.get(task_id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(serde_json::json!(task))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Task not found"})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.status().await)
}

async fn tick(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.manual_tick().await)
}

async fn agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.agent_manifest())
}

async fn tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.tool_definitions().await)
}

fn internal_error(e: Error) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
}
