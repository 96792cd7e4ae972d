//! Message broker abstraction (mechanics only).
//!
//! This module defines the **broker contract** the RPC and notification machinery
//! is written against: named queues, publish, and acknowledged consumption.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a delivery that is not acknowledged (consumer dropped, connection
//!   lost, negative-ack with requeue) is delivered again, flagged `redelivered`
//! - **No ordering guarantees** across producers; consumers must not rely on FIFO
//! - **Unroutable publishes are dropped**: publishing to a queue that does not exist
//!   (e.g. the reply queue of a client that has gone away) succeeds and discards the
//!   message, like an AMQP default-exchange publish with no binding
//!
//! ## Consumption Pattern
//!
//! Consumption is a **blocking receive** inside the loop's own thread, never a callback:
//!
//! ```ignore
//! let mut consumer = broker.consume("ocr_service")?;
//! loop {
//!     match consumer.recv_timeout(Duration::from_millis(250))? {
//!         Some(delivery) => {
//!             process(&delivery.body);
//!             consumer.ack(&delivery.tag)?;
//!         }
//!         None => continue, // check for shutdown
//!     }
//! }
//! ```
//!
//! ## Thread Safety
//!
//! `Broker` is `Send + Sync` and is shared as `Arc<dyn Broker>`. A [`Consumer`] is owned
//! by exactly one thread.

use std::sync::Arc;
use std::time::Duration;

/// Broker-assigned identifier of one delivery, used to ack or nack it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub String);

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer, awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// `true` when this message was delivered before and never acknowledged.
    pub redelivered: bool,
}

/// How a queue should be declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSpec {
    /// Named queue that outlives any single connection (work and notification queues).
    Durable { name: String },
    /// Broker-named queue private to the declaring connection and deleted with it
    /// (reply destinations).
    Exclusive,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self::Durable { name: name.into() }
    }

    pub fn exclusive() -> Self {
        Self::Exclusive
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached, or the connection a consumer was opened on
    /// has been lost. Callers should back off and reconnect.
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(DeliveryTag),

    /// Internal lock poisoning in an in-process broker.
    #[error("broker state poisoned")]
    Poisoned,
}

impl BrokerError {
    /// Whether the error means the consumer/connection must be re-established.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::QueueNotFound(_))
    }
}

/// The receiving side of one queue, owned by a single consumption loop.
pub trait Consumer: Send {
    /// Name of the queue this consumer drains.
    fn queue(&self) -> &str;

    /// Block for up to `timeout` waiting for the next delivery.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to deliver.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Mark a delivery as processed; it will not be delivered again.
    fn ack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery. With `requeue` it becomes available again (flagged redelivered),
    /// otherwise it is discarded.
    fn nack(&mut self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}

/// Transport-agnostic message broker.
///
/// Implementations: [`crate::InMemoryBroker`] for tests/dev, and a Redis Streams
/// adapter in `courier-infra`.
pub trait Broker: Send + Sync {
    /// Declare a queue (idempotent for durable queues) and return its name.
    ///
    /// Exclusive queues get a fresh broker-generated name on every call.
    fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError>;

    /// Delete a queue and any messages in it. Deleting a missing queue is not an error.
    fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Append a message to a queue.
    fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Open a consumer on an existing queue.
    fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        (**self).declare_queue(spec)
    }

    fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        (**self).delete_queue(queue)
    }

    fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        (**self).publish(queue, body)
    }

    fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        (**self).consume(queue)
    }
}
