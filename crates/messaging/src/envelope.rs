use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::CorrelationId;

/// Request envelope for a capability call.
///
/// This is the unit an RPC client publishes to a work queue.
///
/// Notes:
/// - `correlation_id` is minted by the client per call and is the only link
///   between this request and its response.
/// - `reply_to` names the client's exclusive reply queue.
/// - `payload` is capability-specific JSON (e.g. `{"image": "<base64>"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    correlation_id: CorrelationId,
    reply_to: String,
    capability: String,
    payload: JsonValue,
    created_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
        capability: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            correlation_id,
            reply_to: reply_to.into(),
            capability: capability.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time elapsed since the client built this envelope (zero if clocks disagree).
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// Build the success response for this job, carrying its correlation id.
    pub fn reply_ok(&self, result: JsonValue) -> ResponseEnvelope {
        ResponseEnvelope::succeeded(self.correlation_id, result)
    }

    /// Build the failure response for this job, carrying its correlation id.
    pub fn reply_err(&self, failure: WorkerFailure) -> ResponseEnvelope {
        ResponseEnvelope::failed(self.correlation_id, failure)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Succeeded,
    Failed,
}

/// Category of a worker-reported failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No capability is registered under the requested name.
    UnknownCapability,
    /// The payload did not have the shape the capability expects.
    MalformedPayload,
    /// The capability ran and reported an error.
    Capability,
    /// The capability panicked.
    Panicked,
    /// The failure body itself could not be interpreted.
    Unrecognized,
}

/// Structured failure description sent back by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Response envelope published by a worker to the job's `reply_to` queue.
///
/// `result` holds the success payload when `status` is `succeeded`, and a
/// serialized [`WorkerFailure`] otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    correlation_id: CorrelationId,
    status: ResponseStatus,
    result: JsonValue,
}

impl ResponseEnvelope {
    pub fn succeeded(correlation_id: CorrelationId, result: JsonValue) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Succeeded,
            result,
        }
    }

    pub fn failed(correlation_id: CorrelationId, failure: WorkerFailure) -> Self {
        let result = serde_json::to_value(&failure)
            .unwrap_or_else(|_| JsonValue::String(failure.message.clone()));
        Self {
            correlation_id,
            status: ResponseStatus::Failed,
            result,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn result(&self) -> &JsonValue {
        &self.result
    }

    /// Split into the worker's result or its structured failure.
    pub fn into_outcome(self) -> Result<JsonValue, WorkerFailure> {
        match self.status {
            ResponseStatus::Succeeded => Ok(self.result),
            ResponseStatus::Failed => Err(
                serde_json::from_value::<WorkerFailure>(self.result.clone()).unwrap_or_else(|_| {
                    WorkerFailure::new(FailureKind::Unrecognized, self.result.to_string())
                }),
            ),
        }
    }
}

/// One-way notification (no correlation id, no reply destination).
///
/// Delivered at-least-once; consumers must tolerate duplicates.
/// `recipient` also accepts the legacy field name `email`, and unknown
/// fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    #[serde(alias = "email")]
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl NotificationEnvelope {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}
