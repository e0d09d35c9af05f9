use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use cloudtasker_infra::TaskServiceError;

pub fn task_error_to_response(err: TaskServiceError) -> axum::response::Response {
    match err {
        TaskServiceError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("task {id} not found"))
        }
        e @ TaskServiceError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string())
        }
        TaskServiceError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        TaskServiceError::StoreUnavailable(msg) => {
            tracing::warn!(error = %msg, "store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", "Database error")
        }
        e @ TaskServiceError::DeadlineExceeded(_) => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded", e.to_string())
        }
        TaskServiceError::Internal(msg) => {
            tracing::error!(error = %msg, "internal error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}

pub fn json_rejection(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
