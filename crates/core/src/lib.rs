//! `courier-core`: identifiers and error primitives shared by every courier crate.
//!
//! This crate has **no broker or IO concerns**.

pub mod error;
pub mod id;

pub use error::CoreError;
pub use id::{ConsumerId, CorrelationId};
