//! Envelopes and broker mechanics.
//!
//! - [`envelope`]: the structured message bodies exchanged over the broker
//! - [`codec`]: JSON encoding of envelopes, with decode failures as a typed error
//! - [`broker`]: the transport-agnostic broker contract (queues, publish, ack)
//! - [`in_memory_broker`]: an in-process broker for tests and local development

pub mod broker;
pub mod codec;
pub mod envelope;
pub mod in_memory_broker;

pub use broker::{Broker, BrokerError, Consumer, Delivery, DeliveryTag, QueueSpec};
pub use codec::{DecodeError, EncodeError, decode, encode};
pub use envelope::{
    FailureKind, JobEnvelope, NotificationEnvelope, ResponseEnvelope, ResponseStatus,
    WorkerFailure,
};
pub use in_memory_broker::InMemoryBroker;
