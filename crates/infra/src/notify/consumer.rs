use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use courier_messaging::{Broker, Delivery, NotificationEnvelope, QueueSpec, decode};

use super::DEFAULT_NOTIFICATION_QUEUE;
use super::dispatcher::NotifyError;
use crate::reconnect::ReconnectPolicy;
use crate::workers::{ConsumerLoop, DeliveryHandler, Disposition, WorkerHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    #[error("recipient rejected: {0}")]
    Rejected(String),

    #[error("mail transport failed: {0}")]
    Transport(String),
}

/// The external mail transport.
pub trait Mailer: Send + Sync {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

impl<M: Mailer + ?Sized> Mailer for Arc<M> {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MailError> {
        (**self).send(recipient, subject, body)
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConsumerConfig {
    pub queue: String,
    pub reconnect: ReconnectPolicy,
    pub name: String,
}

impl Default for NotificationConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_NOTIFICATION_QUEUE.to_string(),
            reconnect: ReconnectPolicy::default(),
            name: "notification-consumer".to_string(),
        }
    }
}

impl NotificationConsumerConfig {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Drains the notification queue and hands each envelope to the [`Mailer`].
///
/// Every delivery is acked once the send was attempted. A failed send is logged
/// and not retried; a duplicate delivery means a duplicate send.
#[derive(Clone)]
pub struct NotificationConsumer {
    broker: Arc<dyn Broker>,
    mailer: Arc<dyn Mailer>,
    config: NotificationConsumerConfig,
}

impl core::fmt::Debug for NotificationConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotificationConsumer")
            .field("config", &self.config)
            .finish()
    }
}

impl NotificationConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        mailer: Arc<dyn Mailer>,
        config: NotificationConsumerConfig,
    ) -> Self {
        Self {
            broker,
            mailer,
            config,
        }
    }

    /// Declare the queue and start the consumption loop.
    pub fn spawn(self) -> Result<WorkerHandle, NotifyError> {
        self.broker
            .declare_queue(&QueueSpec::durable(&self.config.queue))?;

        let open = {
            let broker = self.broker.clone();
            let queue = self.config.queue.clone();
            move || broker.consume(&queue)
        };

        let name = self.config.name.clone();
        let queue = self.config.queue.clone();
        let handle = ConsumerLoop::new(name.clone(), open, MailHandler(self.clone()))
            .with_reconnect(self.config.reconnect.clone())
            .spawn()?;

        info!(consumer = %name, %queue, "notification consumer started");
        Ok(handle)
    }

    /// Handle one delivery. Always acks.
    pub fn process(&self, delivery: &Delivery) -> Disposition {
        let envelope: NotificationEnvelope = match decode(&delivery.body) {
            Ok(env) => env,
            Err(err) => {
                warn!(consumer = %self.config.name, tag = %delivery.tag, error = %err, "dropping undecodable notification");
                return Disposition::Ack;
            }
        };

        let sent = catch_unwind(AssertUnwindSafe(|| {
            self.mailer
                .send(&envelope.recipient, &envelope.subject, &envelope.body)
        }));

        match sent {
            Ok(Ok(())) => {
                debug!(recipient = %envelope.recipient, redelivered = delivery.redelivered, "notification sent");
            }
            Ok(Err(err)) => {
                warn!(recipient = %envelope.recipient, error = %err, "notification send failed");
            }
            Err(_) => {
                error!(recipient = %envelope.recipient, "mailer panicked");
            }
        }
        Disposition::Ack
    }
}

struct MailHandler(NotificationConsumer);

impl DeliveryHandler for MailHandler {
    fn handle(&mut self, delivery: &Delivery) -> Disposition {
        self.0.process(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use courier_messaging::{DeliveryTag, InMemoryBroker, encode};

    use crate::notify::NotificationDispatcher;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Mailer for Outbox {
        fn send(&self, recipient: &str, subject: &str, _body: &str) -> Result<(), MailError> {
            if recipient.starts_with("bounce") {
                return Err(MailError::Rejected(recipient.to_string()));
            }
            if recipient.starts_with("crash") {
                panic!("smtp client crashed");
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), subject.to_string()));
            Ok(())
        }
    }

    impl Outbox {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    fn delivery(body: Vec<u8>) -> Delivery {
        Delivery {
            tag: DeliveryTag("1".to_string()),
            body,
            redelivered: false,
        }
    }

    fn consumer(broker: &InMemoryBroker, outbox: Arc<Outbox>) -> NotificationConsumer {
        NotificationConsumer::new(
            Arc::new(broker.clone()),
            outbox,
            NotificationConsumerConfig::default(),
        )
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn failures_are_acked_not_retried() {
        let broker = InMemoryBroker::new();
        let outbox = Arc::new(Outbox::default());
        let c = consumer(&broker, outbox.clone());

        let garbage = delivery(b"not json".to_vec());
        assert_eq!(c.process(&garbage), Disposition::Ack);

        let bounce = NotificationEnvelope::new("bounce@example.com", "s", "b");
        assert_eq!(c.process(&delivery(encode(&bounce).unwrap())), Disposition::Ack);

        let crash = NotificationEnvelope::new("crash@example.com", "s", "b");
        assert_eq!(c.process(&delivery(encode(&crash).unwrap())), Disposition::Ack);

        assert_eq!(outbox.count(), 0);
    }

    #[test]
    fn duplicate_delivery_sends_twice_and_keeps_consuming() {
        let broker = InMemoryBroker::new();
        let outbox = Arc::new(Outbox::default());
        let dispatcher = NotificationDispatcher::new(Arc::new(broker.clone()), DEFAULT_NOTIFICATION_QUEUE).unwrap();
        let handle = consumer(&broker, outbox.clone()).spawn().unwrap();

        let otp = NotificationEnvelope::new("user@example.com", "Your OTP", "123456");
        dispatcher.notify_envelope(&otp).unwrap();
        dispatcher.notify_envelope(&otp).unwrap();
        dispatcher.notify("other@example.com", "Welcome", "hi").unwrap();

        assert!(wait_until(|| outbox.count() == 3));
        handle.shutdown();

        let sent = outbox.sent.lock().unwrap();
        let dupes = sent.iter().filter(|(r, _)| r == "user@example.com").count();
        assert_eq!(dupes, 2);
        assert_eq!(broker.ready_count(DEFAULT_NOTIFICATION_QUEUE), 0);
        assert_eq!(broker.unacked_count(DEFAULT_NOTIFICATION_QUEUE), 0);
    }
}
