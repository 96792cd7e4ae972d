//! Fire-and-forget notifications.
//!
//! No correlation, no reply: the producer publishes a [`NotificationEnvelope`]
//! and returns; a [`NotificationConsumer`] delivers it through a [`Mailer`].
//!
//! [`NotificationEnvelope`]: courier_messaging::NotificationEnvelope

pub mod consumer;
pub mod dispatcher;

pub use consumer::{MailError, Mailer, NotificationConsumer, NotificationConsumerConfig};
pub use dispatcher::{NotificationDispatcher, NotifyError};

/// Default notification queue name.
pub const DEFAULT_NOTIFICATION_QUEUE: &str = "email_notification";
