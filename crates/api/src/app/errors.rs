use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_infra::{NotifyError, RpcError};

/// `TimedOut` is ambiguous (the job may still run); everything else is definite.
pub fn rpc_error_to_response(err: RpcError) -> axum::response::Response {
    match err {
        RpcError::TimedOut { correlation_id, waited } => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "timed_out",
            format!("no response for {correlation_id} within {}ms", waited.as_millis()),
        ),
        RpcError::Worker(failure) => json_error(StatusCode::BAD_GATEWAY, "worker_error", failure.to_string()),
        RpcError::UnexpectedResult(msg) => json_error(StatusCode::BAD_GATEWAY, "unexpected_result", msg),
        RpcError::Broker(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", e.to_string()),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string()),
    }
}

pub fn notify_error_to_response(err: NotifyError) -> axum::response::Response {
    match err {
        NotifyError::Broker(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", e.to_string()),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string()),
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
