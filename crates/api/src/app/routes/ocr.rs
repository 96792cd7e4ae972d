use std::sync::Arc;
use std::time::Duration;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::app::services::{AppServices, MAX_RPC_TIMEOUT};
use crate::app::{dto, errors};

pub async fn recognize(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::OcrRequest>,
) -> axum::response::Response {
    let image = match BASE64.decode(body.image.as_bytes()) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "image is empty"),
        Err(e) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("image is not valid base64: {e}"),
            );
        }
    };

    let timeout = match body.timeout_ms {
        None => services.default_timeout,
        Some(0) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "timeout_ms must be positive");
        }
        Some(ms) => Duration::from_millis(ms).min(MAX_RPC_TIMEOUT),
    };

    // The RPC client blocks until the response or the deadline.
    let rpc = services.rpc.clone();
    let outcome = tokio::task::spawn_blocking(move || rpc.recognize(&image, timeout)).await;

    match outcome {
        Ok(Ok(text)) => (StatusCode::OK, Json(dto::OcrResponse { text })).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "ocr call failed");
            errors::rpc_error_to_response(e)
        }
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}
