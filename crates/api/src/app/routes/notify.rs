use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use courier_messaging::NotificationEnvelope;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn notify(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::NotifyRequest>,
) -> axum::response::Response {
    if body.recipient.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "recipient is required");
    }

    let envelope = NotificationEnvelope::new(body.recipient, body.subject, body.body);
    let services_for_publish = services.clone();
    let published = tokio::task::spawn_blocking(move || {
        services_for_publish.notifications.notify_envelope(&envelope)
    })
    .await;

    match published {
        Ok(Ok(())) => (
            StatusCode::ACCEPTED,
            Json(dto::NotifyAccepted {
                status: "queued",
                queue: services.notifications.queue().to_string(),
            }),
        )
            .into_response(),
        Ok(Err(e)) => errors::notify_error_to_response(e),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}
