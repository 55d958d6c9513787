use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use challenge_tree::tree::TreeData;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::models::{PhaseStatus, Task};
use crate::task::CreateTaskOptions;
use crate::{SearchError, SessionService, TaskService};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub tasks: Arc<TaskService>,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub message: String,
    pub tree_size: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskCreateRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub resume: bool,
    pub tree_pickle_path: Option<String>,
    pub resume_phase: Option<String>,
    pub resume_iteration: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub session_id: String,
    pub message: String,
    pub phases: BTreeMap<String, PhaseStatus>,
}

impl TaskResponse {
    fn from_task(task: Task, message: impl Into<String>) -> Self {
        Self {
            task_id: task.task_id,
            session_id: task.session_id,
            message: message.into(),
            phases: task.phases,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<BTreeMap<String, Task>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl IntoResponse for SearchError {
    fn into_response(self) -> Response {
        let status = match &self {
            SearchError::SessionNotFound(_) | SearchError::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SearchError::SessionAlreadyExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(%self, "request failed");
        }
        let body = Json(ErrorResponse {
            detail: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/initialize", post(initialize_session))
        .route("/sessions/:session_id", get(get_session))
        .route("/run", post(run_search))
        .route("/stop/:task_id", post(stop_task))
        .route("/status", get(get_status))
        .route("/tasks/:task_id", get(get_task))
        .route("/tree/:session_id", get(get_tree_data))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "PrismBench - Search Interface",
        "health": "/health",
    }))
}

/// Initialize (or return) the tree for a session.
async fn initialize_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, SearchError> {
    let session = state.sessions.get_or_create_session(&request.session_id)?;
    let tree_size = session.tree.read().len();
    Ok(Json(SessionResponse {
        session_id: session.session_id,
        message: "Session initialized successfully".to_string(),
        tree_size,
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, SearchError> {
    let session = state.sessions.get_session(&session_id)?;
    let tree_size = session.tree.read().len();
    Ok(Json(SessionResponse {
        session_id: session.session_id,
        message: "Session found".to_string(),
        tree_size,
    }))
}

/// Start a search task; returns 202 immediately with the task snapshot.
async fn run_search(
    State(state): State<AppState>,
    request: Option<Json<TaskCreateRequest>>,
) -> Result<(StatusCode, Json<TaskResponse>), SearchError> {
    let request = request.map(|Json(inner)| inner).unwrap_or_default();
    let task = state.tasks.create_task(CreateTaskOptions {
        session_id: request.session_id,
        resume: request.resume,
        tree_pickle_path: request.tree_pickle_path,
        resume_phase: request.resume_phase,
        resume_iteration: request.resume_iteration,
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskResponse::from_task(
            task,
            "Request is being processed asynchronously",
        )),
    ))
}

async fn stop_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, SearchError> {
    let task = state.tasks.stop_task(&task_id)?;
    Ok(Json(TaskResponse::from_task(
        task,
        "Task cancelled successfully",
    )))
}

async fn get_status(State(state): State<AppState>) -> Json<TaskStatusResponse> {
    let tasks = state.tasks.get_all_tasks();
    if tasks.is_empty() {
        Json(TaskStatusResponse {
            tasks: None,
            message: Some("No tasks to report".to_string()),
        })
    } else {
        Json(TaskStatusResponse {
            tasks: Some(tasks.into_iter().collect()),
            message: None,
        })
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, SearchError> {
    let task = state.tasks.get_task(&task_id)?;
    let message = format!("Task status: {}", task.status.as_str());
    Ok(Json(TaskResponse::from_task(task, message)))
}

async fn get_tree_data(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<TreeData>, SearchError> {
    let data = state.sessions.session_tree_data(&session_id)?;
    Ok(Json(data))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "search",
    })
}
