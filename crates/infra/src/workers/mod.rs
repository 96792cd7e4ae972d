//! Background consumption loops (one OS thread per loop).

pub mod consumer_loop;

pub use consumer_loop::{ConsumerLoop, DeliveryHandler, Disposition, WorkerGroup, WorkerHandle};
