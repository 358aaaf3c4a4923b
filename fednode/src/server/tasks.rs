//! Task endpoints.

use axum::Router;
use axum::body::Body;
use axum::extract::State as AxumState;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::patch;
use axum::routing::post;
use axum::routing::put;
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::Error;
use super::Json;
use super::Path;
use super::ServerResponse;
use super::State;
use crate::engine::ResultsOutcome;
use crate::engine::TaskDefinition;

/// The header the authentication layer forwards the caller's user id in.
const USER_ID_HEADER: &str = "x-user-id";

/// The header the authentication layer sets for administrator calls.
const ADMIN_HEADER: &str = "x-admin";

/// Gets the task router.
pub fn router() -> Router<State> {
    Router::new()
        .route("/tasks", post(post_task).get(get_tasks))
        .route("/tasks/validate", post(validate_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/status", get(get_status))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/results", get(get_results))
        .route("/tasks/{id}/logs", get(get_logs))
        .route("/tasks/{id}/suspend", patch(suspend_task))
        .route("/tasks/{id}/resume", patch(resume_task))
        .route("/tasks/{id}/review/approve", put(approve_task))
        .route("/tasks/{id}/review/block", put(block_task))
}

/// Whether the authentication layer marked the request as administrative.
fn is_admin(headers: &HeaderMap) -> bool {
    headers
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// `POST /tasks`: submits a task.
async fn post_task(
    AxumState(state): AxumState<State>,
    headers: HeaderMap,
    Json(mut def): Json<TaskDefinition>,
) -> ServerResponse<impl IntoResponse> {
    if def.requested_by.is_none() {
        def.requested_by = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
    }

    let record = state.service.submit(&def).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "task_id": record.id })),
    ))
}

/// `POST /tasks/validate`: validates a submission without running it.
async fn validate_task(
    AxumState(state): AxumState<State>,
    Json(def): Json<TaskDefinition>,
) -> ServerResponse<impl IntoResponse> {
    state.service.validate(&def).await?;
    Ok(Json(json!({ "message": "Task definition is valid" })))
}

/// `GET /tasks`: lists tasks.
async fn get_tasks(AxumState(state): AxumState<State>) -> ServerResponse<impl IntoResponse> {
    let tasks = state.service.list_tasks().await?;
    Ok(Json(tasks))
}

/// `GET /tasks/{id}`: gets a task row with its derived status.
async fn get_task(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    let record = state.service.get_task(id).await?;
    let status = state.service.status(id).await?;

    let mut body = serde_json::to_value(&record).map_err(|e| {
        tracing::error!("failed to serialize task {id}: {e}");
        Error {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: StatusCode::INTERNAL_SERVER_ERROR.to_string(),
        }
    })?;
    body["status"] = serde_json::to_value(&status).unwrap_or_default();
    body["review"] = json!(record.review_status.label());
    Ok(Json(body))
}

/// `GET /tasks/{id}/status`: gets the derived status alone.
async fn get_status(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    let status = state.service.status(id).await?;
    Ok(Json(status))
}

/// `POST /tasks/{id}/cancel`: cancels a task.
async fn cancel_task(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    let record = state.service.cancel(id).await?;
    Ok(Json(record))
}

/// `GET /tasks/{id}/results`: retrieves the results archive.
///
/// When release review is required and the task is unapproved, the gate
/// state is returned instead of the archive.
async fn get_results(
    AxumState(state): AxumState<State>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ServerResponse<Response> {
    match state.service.get_results(id, is_admin(&headers)).await? {
        ResultsOutcome::ReviewPending(label) => {
            Ok(Json(json!({ "review_status": label })).into_response())
        }
        ResultsOutcome::Archive(path) => {
            let file = tokio::fs::File::open(&path).await.map_err(|e| {
                tracing::error!(
                    "failed to open results archive `{path}`: {e}",
                    path = path.display()
                );
                Error {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: StatusCode::INTERNAL_SERVER_ERROR.to_string(),
                }
            })?;

            let headers = [
                (header::CONTENT_TYPE, "application/x-tar".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"results-{id}.tar\""),
                ),
            ];
            Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
        }
    }
}

/// `GET /tasks/{id}/logs`: gets the logs of every pod the task has had.
async fn get_logs(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    let logs = state.service.get_logs(id).await?;
    Ok(Json(json!({ "logs": logs })))
}

/// `PATCH /tasks/{id}/suspend`: suspends a scheduled task.
async fn suspend_task(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    state.service.suspend(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `PATCH /tasks/{id}/resume`: resumes a suspended task.
async fn resume_task(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    state.service.resume(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `PUT /tasks/{id}/review/approve`: approves result release.
async fn approve_task(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    let label = state.service.review(id, true).await?;
    Ok(Json(json!({ "review_status": label })))
}

/// `PUT /tasks/{id}/review/block`: blocks result release.
async fn block_task(
    AxumState(state): AxumState<State>,
    Path(id): Path<i64>,
) -> ServerResponse<impl IntoResponse> {
    let label = state.service.review(id, false).await?;
    Ok(Json(json!({ "review_status": label })))
}
