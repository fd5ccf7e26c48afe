//! HTTP route handlers for the run API.
//!
//! Handlers hand the blocking pipeline work to `spawn_blocking` and map the
//! typed pipeline errors onto status codes.

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Serialize;
use tracing::error;

use pipeline::core::errors::{InvalidTransitionError, RunNotFoundError};
use pipeline::core::run::{RunInput, RunRecord};
use pipeline::service::ReviewRequest;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/review", post(review_run))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "invalid_input",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if err.downcast_ref::<RunNotFoundError>().is_some() {
            return Self {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message,
            };
        }
        if err.downcast_ref::<InvalidTransitionError>().is_some() {
            return Self {
                status: StatusCode::CONFLICT,
                code: "invalid_transition",
                message,
            };
        }
        error!(error = %message, "request failed");
        Self::internal(message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::unprocessable(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Run blocking pipeline work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::internal(format!("worker task failed: {err}")))?
        .map_err(ApiError::from)
}

fn validate_input(input: &RunInput) -> Result<(), ApiError> {
    if input.task_id.trim().is_empty() {
        return Err(ApiError::unprocessable("taskId must not be empty"));
    }
    if !input.repo_path.is_dir() {
        return Err(ApiError::unprocessable(format!(
            "repoPath {} is not a directory",
            input.repo_path.display()
        )));
    }
    Ok(())
}

/// GET /api/runs - all runs, oldest first.
async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.list_runs()).await?))
}

/// POST /api/runs - run the start sequence; the record comes back either
/// awaiting approval or failed.
async fn start_run(
    State(state): State<AppState>,
    payload: Result<Json<RunInput>, JsonRejection>,
) -> Result<(StatusCode, Json<RunRecord>), ApiError> {
    let Json(mut input) = payload?;
    validate_input(&input)?;
    input.task_id = input.task_id.trim().to_string();
    let service = state.service.clone();
    let record = blocking(move || service.start_run(input)).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/runs/{run_id}
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.get_run(&run_id)).await?))
}

/// POST /api/runs/{run_id}/review - approve (and finalize) or reject.
async fn review_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    payload: Result<Json<ReviewRequest>, JsonRejection>,
) -> Result<Json<RunRecord>, ApiError> {
    let Json(review) = payload?;
    let service = state.service.clone();
    Ok(Json(
        blocking(move || service.review_run(&run_id, review)).await?,
    ))
}
