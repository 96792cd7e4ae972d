//! RPC worker: consume jobs, run the capability, publish the response.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use courier_messaging::{
    Broker, Delivery, FailureKind, JobEnvelope, QueueSpec, ResponseEnvelope, WorkerFailure, decode,
    encode,
};

use super::client::DEFAULT_WORK_QUEUE;
use super::error::RpcError;
use crate::capability::CapabilityRouter;
use crate::reconnect::ReconnectPolicy;
use crate::workers::{ConsumerLoop, DeliveryHandler, Disposition, WorkerGroup};

/// RPC worker configuration.
#[derive(Debug, Clone)]
pub struct RpcWorkerConfig {
    /// Queue jobs are consumed from
    pub work_queue: String,
    /// Number of competing consumer threads
    pub concurrency: usize,
    /// Backoff after connection loss
    pub reconnect: ReconnectPolicy,
    /// Name for logging / thread names
    pub name: String,
}

impl Default for RpcWorkerConfig {
    fn default() -> Self {
        Self {
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            concurrency: 1,
            reconnect: ReconnectPolicy::default(),
            name: "rpc-worker".to_string(),
        }
    }
}

impl RpcWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_work_queue(mut self, queue: impl Into<String>) -> Self {
        self.work_queue = queue.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Worker side of RPC-over-broker.
///
/// Stateless transform from [`JobEnvelope`] to [`ResponseEnvelope`]:
/// - every decodable job gets a response, `failed` if the capability errors,
///   is unknown, or panics
/// - undecodable messages are acked and dropped (there is nobody to reply to)
/// - a job is acked only after its response was published; if publishing fails
///   the job is requeued
#[derive(Clone)]
pub struct RpcWorker {
    broker: Arc<dyn Broker>,
    router: Arc<CapabilityRouter>,
    config: RpcWorkerConfig,
}

impl core::fmt::Debug for RpcWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcWorker")
            .field("router", &self.router)
            .field("config", &self.config)
            .finish()
    }
}

impl RpcWorker {
    pub fn new(broker: Arc<dyn Broker>, router: CapabilityRouter, config: RpcWorkerConfig) -> Self {
        Self {
            broker,
            router: Arc::new(router),
            config,
        }
    }

    /// Declare the work queue and start `concurrency` consumer loops.
    pub fn spawn(self) -> Result<WorkerGroup, RpcError> {
        self.broker
            .declare_queue(&QueueSpec::durable(&self.config.work_queue))?;

        let mut group = WorkerGroup::default();
        for i in 0..self.config.concurrency.max(1) {
            let name = format!("{}-{}", self.config.name, i);
            let open = {
                let broker = self.broker.clone();
                let queue = self.config.work_queue.clone();
                move || broker.consume(&queue)
            };

            let handle = ConsumerLoop::new(name, open, JobHandler(self.clone()))
                .with_reconnect(self.config.reconnect.clone())
                .spawn()?;
            group.push(handle);
        }

        info!(
            worker = %self.config.name,
            queue = %self.config.work_queue,
            concurrency = group.len(),
            "rpc worker started"
        );
        Ok(group)
    }

    /// Handle one delivery from the work queue.
    pub fn process(&self, delivery: &Delivery) -> Disposition {
        let job: JobEnvelope = match decode(&delivery.body) {
            Ok(job) => job,
            Err(err) => {
                warn!(worker = %self.config.name, tag = %delivery.tag, error = %err, "dropping undecodable job envelope");
                return Disposition::Ack;
            }
        };

        let correlation_id = job.correlation_id();
        if delivery.redelivered {
            debug!(%correlation_id, "processing redelivered job");
        }

        let response = self.execute(&job);
        let body = match encode(&response) {
            Ok(body) => body,
            Err(err) => {
                // Result not serializable: still tell the caller something went wrong.
                error!(%correlation_id, error = %err, "failed to encode response");
                let fallback = job.reply_err(WorkerFailure::new(FailureKind::Capability, err.to_string()));
                match encode(&fallback) {
                    Ok(body) => body,
                    Err(_) => return Disposition::Ack,
                }
            }
        };

        match self.broker.publish(job.reply_to(), body) {
            Ok(()) => {
                debug!(
                    %correlation_id,
                    reply_to = job.reply_to(),
                    status = ?response.status(),
                    age = ?job.age(),
                    "response published"
                );
                Disposition::Ack
            }
            Err(err) => {
                warn!(%correlation_id, error = %err, "failed to publish response; requeueing job");
                Disposition::Requeue
            }
        }
    }

    /// Run the requested capability. Never fails: errors become `failed` responses.
    pub fn execute(&self, job: &JobEnvelope) -> ResponseEnvelope {
        let Some(capability) = self.router.resolve(job.capability()) else {
            return job.reply_err(WorkerFailure::new(
                FailureKind::UnknownCapability,
                format!("no capability registered for `{}`", job.capability()),
            ));
        };

        match catch_unwind(AssertUnwindSafe(|| capability.invoke(job.payload()))) {
            Ok(Ok(result)) => job.reply_ok(result),
            Ok(Err(err)) => {
                warn!(correlation_id = %job.correlation_id(), capability = job.capability(), error = %err, "capability failed");
                job.reply_err(WorkerFailure::new(err.failure_kind(), err.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(correlation_id = %job.correlation_id(), capability = job.capability(), %message, "capability panicked");
                job.reply_err(WorkerFailure::new(FailureKind::Panicked, message))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "capability panicked".to_string()
    }
}

struct JobHandler(RpcWorker);

impl DeliveryHandler for JobHandler {
    fn handle(&mut self, delivery: &Delivery) -> Disposition {
        self.0.process(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use courier_core::CorrelationId;
    use courier_messaging::{Consumer, DeliveryTag, InMemoryBroker, ResponseStatus};
    use serde_json::{Value as JsonValue, json};

    use crate::capability::CapabilityError;

    fn echo(payload: &JsonValue) -> Result<JsonValue, CapabilityError> {
        Ok(payload.clone())
    }

    fn worker(broker: &InMemoryBroker, router: CapabilityRouter) -> RpcWorker {
        RpcWorker::new(Arc::new(broker.clone()), router, RpcWorkerConfig::default())
    }

    fn delivery_for(job: &JobEnvelope) -> Delivery {
        Delivery {
            tag: DeliveryTag("1".to_string()),
            body: encode(job).unwrap(),
            redelivered: false,
        }
    }

    fn reply_queue(broker: &InMemoryBroker) -> (String, Box<dyn Consumer>) {
        let name = broker.declare_queue(&QueueSpec::exclusive()).unwrap();
        let consumer = broker.consume(&name).unwrap();
        (name, consumer)
    }

    fn next_response(consumer: &mut Box<dyn Consumer>) -> ResponseEnvelope {
        let d = consumer.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        decode(&d.body).unwrap()
    }

    #[test]
    fn success_response_copies_correlation_id() {
        let broker = InMemoryBroker::new();
        let router = CapabilityRouter::new().with("echo", echo);
        let w = worker(&broker, router);
        let (reply, mut replies) = reply_queue(&broker);

        let job = JobEnvelope::new(CorrelationId::new(), &reply, "echo", json!({"x": 1}));
        assert_eq!(w.process(&delivery_for(&job)), Disposition::Ack);

        let resp = next_response(&mut replies);
        assert_eq!(resp.correlation_id(), job.correlation_id());
        assert_eq!(resp.status(), ResponseStatus::Succeeded);
        assert_eq!(resp.result(), &json!({"x": 1}));
    }

    #[test]
    fn panicking_capability_still_gets_failed_response() {
        let broker = InMemoryBroker::new();
        let router = CapabilityRouter::new().with("boom", |_: &JsonValue| -> Result<JsonValue, CapabilityError> {
            panic!("model crashed")
        });
        let w = worker(&broker, router);
        let (reply, mut replies) = reply_queue(&broker);

        let job = JobEnvelope::new(CorrelationId::new(), &reply, "boom", json!({}));
        assert_eq!(w.process(&delivery_for(&job)), Disposition::Ack);

        let resp = next_response(&mut replies);
        assert_eq!(resp.correlation_id(), job.correlation_id());
        let failure = resp.into_outcome().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert!(failure.message.contains("model crashed"));
    }

    #[test]
    fn capability_error_and_unknown_capability_become_failed_responses() {
        let broker = InMemoryBroker::new();
        let router = CapabilityRouter::new().with(
            "strict",
            |_: &JsonValue| -> Result<JsonValue, CapabilityError> {
                Err(CapabilityError::malformed("bad image"))
            },
        );
        let w = worker(&broker, router);
        let (reply, mut replies) = reply_queue(&broker);

        let bad = JobEnvelope::new(CorrelationId::new(), &reply, "strict", json!({}));
        let unknown = JobEnvelope::new(CorrelationId::new(), &reply, "translate", json!({}));
        w.process(&delivery_for(&bad));
        w.process(&delivery_for(&unknown));

        let first = next_response(&mut replies);
        assert_eq!(first.correlation_id(), bad.correlation_id());
        assert_eq!(first.into_outcome().unwrap_err().kind, FailureKind::MalformedPayload);

        let second = next_response(&mut replies);
        assert_eq!(second.correlation_id(), unknown.correlation_id());
        assert_eq!(second.into_outcome().unwrap_err().kind, FailureKind::UnknownCapability);
    }

    #[test]
    fn undecodable_job_is_acked_without_reply() {
        let broker = InMemoryBroker::new();
        let w = worker(&broker, CapabilityRouter::new());

        let garbage = Delivery {
            tag: DeliveryTag("9".to_string()),
            body: b"\x00\x01 not an envelope".to_vec(),
            redelivered: false,
        };
        assert_eq!(w.process(&garbage), Disposition::Ack);

        let empty = Delivery {
            tag: DeliveryTag("10".to_string()),
            body: Vec::new(),
            redelivered: true,
        };
        assert_eq!(w.process(&empty), Disposition::Ack);
    }

    #[test]
    fn publish_failure_requeues_job() {
        let broker = InMemoryBroker::new();
        let router = CapabilityRouter::new().with("echo", echo);
        let w = worker(&broker, router);

        let job = JobEnvelope::new(CorrelationId::new(), "amq.gen-x", "echo", json!({}));
        broker.disconnect();
        assert_eq!(w.process(&delivery_for(&job)), Disposition::Requeue);
        broker.reconnect();
    }

    #[test]
    fn spawned_workers_drain_the_queue() {
        let broker = InMemoryBroker::new();
        let router = CapabilityRouter::new().with("echo", echo);
        let config = RpcWorkerConfig::default().with_concurrency(3);
        let group = RpcWorker::new(Arc::new(broker.clone()), router, config)
            .spawn()
            .unwrap();
        assert_eq!(group.len(), 3);

        let (reply, mut replies) = reply_queue(&broker);
        for i in 0..10 {
            let job = JobEnvelope::new(CorrelationId::new(), &reply, "echo", json!(i));
            broker.publish(DEFAULT_WORK_QUEUE, encode(&job).unwrap()).unwrap();
        }

        let mut seen: Vec<i64> = (0..10)
            .map(|_| next_response(&mut replies).result().as_i64().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        group.shutdown();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(broker.unacked_count(DEFAULT_WORK_QUEUE), 0);
    }
}
