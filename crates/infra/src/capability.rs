//! Capabilities a worker can execute, and routing by capability name.
//!
//! Routing rules, in order:
//! - exact name match (`"recognize"`)
//! - category match (`"ocr.*"` matches `"ocr.receipt"`)
//! - wildcard (`"*"`)

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value as JsonValue, json};

use courier_messaging::FailureKind;

/// Capability name of the OCR call.
pub const RECOGNIZE: &str = "recognize";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// The payload did not have the expected shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The capability ran and failed (external error, unreadable input, ...).
    #[error("capability failed: {0}")]
    Failed(String),
}

impl CapabilityError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CapabilityError::MalformedPayload(_) => FailureKind::MalformedPayload,
            CapabilityError::Failed(_) => FailureKind::Capability,
        }
    }
}

/// A named unit of work executed by an RPC worker.
///
/// Invocations must be safe to repeat: a job is redelivered if the worker dies
/// before acknowledging it.
pub trait Capability: Send + Sync {
    fn invoke(&self, payload: &JsonValue) -> Result<JsonValue, CapabilityError>;
}

impl<F> Capability for F
where
    F: Fn(&JsonValue) -> Result<JsonValue, CapabilityError> + Send + Sync,
{
    fn invoke(&self, payload: &JsonValue) -> Result<JsonValue, CapabilityError> {
        self(payload)
    }
}

/// Maps capability names to implementations.
#[derive(Default, Clone)]
pub struct CapabilityRouter {
    routes: HashMap<String, Arc<dyn Capability>>,
}

impl core::fmt::Debug for CapabilityRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CapabilityRouter")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CapabilityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under a name pattern.
    pub fn register(&mut self, pattern: impl Into<String>, capability: impl Capability + 'static) {
        self.routes.insert(pattern.into(), Arc::new(capability));
    }

    pub fn with(mut self, pattern: impl Into<String>, capability: impl Capability + 'static) -> Self {
        self.register(pattern, capability);
        self
    }

    /// Find the capability for a requested name.
    pub fn resolve(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        if let Some(c) = self.routes.get(name) {
            return Some(c);
        }

        for (pattern, capability) in &self.routes {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if name
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
                {
                    return Some(capability);
                }
            }
        }

        self.routes.get("*")
    }
}

/// The external OCR model: image bytes in, text out.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image: &[u8]) -> Result<String, CapabilityError>;
}

impl<R: Recognizer + ?Sized> Recognizer for Arc<R> {
    fn recognize(&self, image: &[u8]) -> Result<String, CapabilityError> {
        (**self).recognize(image)
    }
}

/// OCR capability.
///
/// Payload: `{"image": "<base64>"}` (the gateway's older `file` field is accepted too).
/// Result: `{"text": "<recognized text>"}`.
#[derive(Debug, Clone)]
pub struct OcrCapability<R> {
    recognizer: R,
}

impl<R: Recognizer> OcrCapability<R> {
    pub fn new(recognizer: R) -> Self {
        Self { recognizer }
    }
}

impl<R: Recognizer> Capability for OcrCapability<R> {
    fn invoke(&self, payload: &JsonValue) -> Result<JsonValue, CapabilityError> {
        let encoded = payload
            .get("image")
            .or_else(|| payload.get("file"))
            .and_then(JsonValue::as_str)
            .ok_or_else(|| CapabilityError::malformed("expected base64 string field `image`"))?;

        let image = BASE64
            .decode(encoded)
            .map_err(|e| CapabilityError::malformed(format!("image is not valid base64: {e}")))?;

        let text = self.recognizer.recognize(&image)?;
        Ok(json!({ "text": text }))
    }
}

/// Encode raw image bytes into an OCR payload.
pub fn ocr_payload(image: &[u8]) -> JsonValue {
    json!({ "image": BASE64.encode(image) })
}
