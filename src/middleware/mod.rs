//! HTTP middleware

mod tracing;

pub use tracing::request_tracing;
