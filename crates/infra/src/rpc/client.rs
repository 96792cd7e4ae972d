//! RPC client: publish a job, wait for the matching response.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use courier_core::CorrelationId;
use courier_messaging::{
    Broker, BrokerError, Consumer, Delivery, JobEnvelope, QueueSpec, ResponseEnvelope, decode,
    encode,
};

use super::error::RpcError;
use super::registry::CorrelationRegistry;
use crate::capability::{RECOGNIZE, ocr_payload};
use crate::reconnect::ReconnectPolicy;
use crate::workers::{ConsumerLoop, DeliveryHandler, Disposition, WorkerHandle};

/// Default work queue name for OCR jobs.
pub const DEFAULT_WORK_QUEUE: &str = "ocr_service";

/// RPC client configuration.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Queue jobs are published to
    pub work_queue: String,
    /// Deadline used by [`RpcClient::call_default`]
    pub default_timeout: Duration,
    /// Backoff for the reply loop after connection loss
    pub reconnect: ReconnectPolicy,
    /// Name for logging / the reply loop thread
    pub name: String,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            default_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            name: "rpc-client".to_string(),
        }
    }
}

impl RpcClientConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_work_queue(mut self, queue: impl Into<String>) -> Self {
        self.work_queue = queue.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Client side of RPC-over-broker.
///
/// - One exclusive reply queue per client, shared by all concurrent calls and
///   drained by a single reply loop thread
/// - Responses are matched to callers by correlation id through the
///   [`CorrelationRegistry`]
/// - If the connection drops, the reply loop declares a fresh reply queue; calls in
///   flight at that moment time out (their replies went to the old queue)
///
/// `RpcClient` is `Sync`: share it behind an `Arc` and call from many threads.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    registry: Arc<CorrelationRegistry>,
    reply_to: Arc<RwLock<String>>,
    config: RpcClientConfig,
    reply_loop: Option<WorkerHandle>,
}

impl core::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_to", &self.reply_queue())
            .field("work_queue", &self.config.work_queue)
            .field("pending", &self.registry.pending_count())
            .finish()
    }
}

impl RpcClient {
    /// Declare the work queue and a private reply queue, and start the reply loop.
    pub fn connect(broker: Arc<dyn Broker>, config: RpcClientConfig) -> Result<Self, RpcError> {
        broker.declare_queue(&QueueSpec::durable(&config.work_queue))?;
        let reply_queue = broker.declare_queue(&QueueSpec::exclusive())?;
        info!(client = %config.name, reply_to = %reply_queue, work_queue = %config.work_queue, "rpc client connected");

        let registry = Arc::new(CorrelationRegistry::new());
        let reply_to = Arc::new(RwLock::new(reply_queue));

        let open = {
            let broker = broker.clone();
            let reply_to = reply_to.clone();
            move || open_reply_consumer(broker.as_ref(), &reply_to)
        };

        let reply_loop = ConsumerLoop::new(
            format!("{}-replies", config.name),
            open,
            ReplyHandler {
                registry: registry.clone(),
            },
        )
        .with_reconnect(config.reconnect.clone())
        .spawn()?;

        Ok(Self {
            broker,
            registry,
            reply_to,
            config,
            reply_loop: Some(reply_loop),
        })
    }

    /// Name of the reply queue responses are currently routed to.
    pub fn reply_queue(&self) -> String {
        self.reply_to
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Invoke `capability` with `payload` and wait at most `timeout`.
    ///
    /// Exactly one job is published. On [`RpcError::TimedOut`] the job may still run
    /// and its eventual response is discarded.
    #[instrument(
        skip(self, payload),
        fields(client = %self.config.name, correlation_id = tracing::field::Empty),
        err(level = "debug")
    )]
    pub fn call(
        &self,
        capability: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue, RpcError> {
        let correlation_id = CorrelationId::new();
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));

        let pending = self.registry.register(correlation_id, timeout)?;

        let job = JobEnvelope::new(correlation_id, self.reply_queue(), capability, payload);
        let body = encode(&job)?;
        // On failure `pending` drops here and unregisters itself.
        self.broker.publish(&self.config.work_queue, body)?;
        debug!(reply_to = job.reply_to(), "job published");

        let response = pending.wait()?;
        Ok(response.into_outcome()?)
    }

    /// [`RpcClient::call`] with the configured default timeout.
    pub fn call_default(&self, capability: &str, payload: JsonValue) -> Result<JsonValue, RpcError> {
        self.call(capability, payload, self.config.default_timeout)
    }

    /// Run OCR on raw image bytes and return the recognized text.
    pub fn recognize(&self, image: &[u8], timeout: Duration) -> Result<String, RpcError> {
        let result = self.call(RECOGNIZE, ocr_payload(image), timeout)?;
        result
            .get("text")
            .and_then(JsonValue::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RpcError::UnexpectedResult(result.to_string()))
    }

    /// Stop the reply loop and delete the reply queue.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(handle) = self.reply_loop.take() {
            handle.shutdown();
            let queue = self.reply_queue();
            if let Err(err) = self.broker.delete_queue(&queue) {
                warn!(client = %self.config.name, reply_to = %queue, error = %err, "failed to delete reply queue");
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open a consumer on the reply queue, declaring a fresh one if the old queue was
/// lost along with the connection.
fn open_reply_consumer(
    broker: &dyn Broker,
    reply_to: &RwLock<String>,
) -> Result<Box<dyn Consumer>, BrokerError> {
    let current = reply_to.read().unwrap_or_else(PoisonError::into_inner).clone();
    match broker.consume(&current) {
        Err(BrokerError::QueueNotFound(_)) => {
            let fresh = broker.declare_queue(&QueueSpec::exclusive())?;
            warn!(old = %current, new = %fresh, "reply queue lost; declared a new one");
            *reply_to.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
            broker.consume(&fresh)
        }
        other => other,
    }
}

/// Dispatches each response on the reply queue to the registry.
struct ReplyHandler {
    registry: Arc<CorrelationRegistry>,
}

impl DeliveryHandler for ReplyHandler {
    fn handle(&mut self, delivery: &Delivery) -> Disposition {
        match decode::<ResponseEnvelope>(&delivery.body) {
            Ok(response) => {
                self.registry.resolve(response);
            }
            Err(err) => warn!(error = %err, "dropping undecodable response envelope"),
        }
        Disposition::Ack
    }

    fn on_idle(&mut self) {
        let expired = self.registry.expire_overdue();
        if expired > 0 {
            debug!(expired, "expired overdue calls");
        }
    }
}
