use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use dunning_core::DunningError;
use dunning_sequence::DunningStatus;

pub fn error_to_response(err: DunningError) -> axum::response::Response {
    match err {
        DunningError::NotFound { sequence_id } => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("dunning sequence {sequence_id} not found"),
        ),
        DunningError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DunningError::InvalidTransition { current, event } => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_transition",
            format!("cannot apply {event} while sequence is {current}"),
        ),
        DunningError::TooEarlyForRetry { next_retry_at } => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "too_early_for_retry",
            format!("retry not due until {next_retry_at}"),
        ),
        DunningError::ConcurrentModification { expected, actual } => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("expected version {expected}, found {actual}"),
        ),
        DunningError::Gateway { message, .. } => {
            json_error(StatusCode::BAD_GATEWAY, "gateway_error", message)
        }
        DunningError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg),
    }
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

pub fn parse_status(s: &str) -> Result<DunningStatus, axum::response::Response> {
    s.to_lowercase().parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: active, paused, escalated, recovered, cancelled, exhausted",
        )
    })
}
