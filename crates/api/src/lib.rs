//! HTTP gateway: accepts OCR and notification requests and forwards them over
//! the broker.

pub mod app;
