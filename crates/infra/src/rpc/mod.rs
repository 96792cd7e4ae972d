//! Request/response over a broker.
//!
//! ```text
//! RpcClient ──JobEnvelope──▶ work queue ──▶ RpcWorker
//!     ▲                                         │
//!     └── CorrelationRegistry ◀── reply queue ◀─┘ ResponseEnvelope
//! ```
//!
//! A call that times out has an **unknown** outcome: the worker may still run the
//! job and publish a response, which the client then discards. There is no
//! worker-side cancellation.

pub mod client;
pub mod error;
pub mod registry;
pub mod worker;

pub use client::{RpcClient, RpcClientConfig};
pub use error::RpcError;
pub use registry::{CorrelationRegistry, PendingCall};
pub use worker::{RpcWorker, RpcWorkerConfig};
