use axum::{Router, routing::post};

pub mod notify;
pub mod ocr;
pub mod system;

/// Router for the broker-backed endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/ocr", post(ocr::recognize))
        .route("/notify", post(notify::notify))
}
