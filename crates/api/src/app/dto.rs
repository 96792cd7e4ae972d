use serde::{Deserialize, Serialize};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct OcrRequest {
    /// Base64-encoded image bytes
    pub image: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(alias = "email")]
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct OcrResponse {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct NotifyAccepted {
    pub status: &'static str,
    pub queue: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub reply_queue: String,
    pub pending_calls: usize,
}
