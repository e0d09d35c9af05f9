use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};

use cloudtasker_core::{JobId, JobStatus};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_task))
        .route("/:id", get(get_task))
        .route("/:id/status", post(update_task_status))
}

pub async fn create_task(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Result<Json<dto::CreateTaskRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };

    let Some(payload) = dto::payload_text(body.payload) else {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "No payload provided");
    };

    let timeout = services.request_timeout(&headers);
    match services.tasks.create_task(payload, timeout).await {
        Ok(receipt) => (StatusCode::CREATED, Json(dto::ReceiptResponse::from(receipt))).into_response(),
        Err(e) => errors::task_error_to_response(e),
    }
}

pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    let timeout = services.request_timeout(&headers);
    match services.tasks.get_task(job_id, timeout).await {
        Ok(job) => Json(dto::TaskResponse::from(&job)).into_response(),
        Err(e) => errors::task_error_to_response(e),
    }
}

pub async fn update_task_status(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<dto::UpdateStatusRequest>, JsonRejection>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };
    let Some(status) = JobStatus::parse(&body.status) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: PENDING, DISPATCHED, RUNNING, SUCCEEDED, FAILED",
        );
    };

    let timeout = services.request_timeout(&headers);
    let result = dto::payload_text(body.result);
    match services
        .tasks
        .update_task_status(job_id, status, result, timeout)
        .await
    {
        Ok(receipt) => Json(dto::ReceiptResponse::from(receipt)).into_response(),
        Err(e) => errors::task_error_to_response(e),
    }
}
