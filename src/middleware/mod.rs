//! Middleware for ParcelVault API
//!
//! Request tracing and security headers.

mod security;
mod tracing;

pub use security::{hsts_header, security_headers};
pub use tracing::request_tracing;
