use std::sync::Arc;

use tracing::{debug, instrument};

use courier_messaging::{Broker, BrokerError, EncodeError, NotificationEnvelope, QueueSpec, encode};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Publishes notifications to a durable queue.
#[derive(Clone)]
pub struct NotificationDispatcher {
    broker: Arc<dyn Broker>,
    queue: String,
}

impl core::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("queue", &self.queue)
            .finish()
    }
}

impl NotificationDispatcher {
    /// Declare `queue` and return a dispatcher publishing to it.
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Result<Self, NotifyError> {
        let queue = queue.into();
        broker.declare_queue(&QueueSpec::durable(&queue))?;
        Ok(Self { broker, queue })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish a notification and return without waiting for delivery.
    pub fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        self.notify_envelope(&NotificationEnvelope::new(recipient, subject, body))
    }

    #[instrument(skip(self, envelope), fields(queue = %self.queue, recipient = %envelope.recipient))]
    pub fn notify_envelope(&self, envelope: &NotificationEnvelope) -> Result<(), NotifyError> {
        let body = encode(envelope)?;
        self.broker.publish(&self.queue, body)?;
        debug!("notification published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use courier_messaging::{InMemoryBroker, decode};

    #[test]
    fn notify_publishes_one_envelope() {
        let broker = InMemoryBroker::new();
        let dispatcher = NotificationDispatcher::new(Arc::new(broker.clone()), "mail").unwrap();

        dispatcher.notify("a@example.com", "hi", "body").unwrap();
        assert_eq!(broker.ready_count("mail"), 1);

        let mut consumer = broker.consume("mail").unwrap();
        let d = consumer.recv_timeout(Duration::from_millis(100)).unwrap().unwrap();
        let env: NotificationEnvelope = decode(&d.body).unwrap();
        assert_eq!(env, NotificationEnvelope::new("a@example.com", "hi", "body"));
    }

    #[test]
    fn publish_failure_is_reported() {
        let broker = InMemoryBroker::new();
        let dispatcher = NotificationDispatcher::new(Arc::new(broker.clone()), "mail").unwrap();
        broker.disconnect();

        let err = dispatcher.notify("a@example.com", "hi", "body").unwrap_err();
        assert!(matches!(err, NotifyError::Broker(_)));
    }
}
