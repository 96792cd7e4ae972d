//! Infrastructure layer: RPC-over-broker machinery, notification delivery,
//! broker adapters, configuration.

pub mod broker;
pub mod capability;
pub mod config;
pub mod notify;
pub mod reconnect;
pub mod rpc;
pub mod workers;


pub use capability::{Capability, CapabilityError, CapabilityRouter, OcrCapability, Recognizer};
pub use config::{ConfigError, CourierConfig};
pub use notify::{
    MailError, Mailer, NotificationConsumer, NotificationConsumerConfig, NotificationDispatcher,
    NotifyError,
};
pub use reconnect::{Backoff, BackoffStrategy, ReconnectPolicy};
pub use rpc::{CorrelationRegistry, PendingCall, RpcClient, RpcClientConfig, RpcError, RpcWorker, RpcWorkerConfig};
pub use workers::{WorkerGroup, WorkerHandle};
