//! HTTP gateway for the OpsMesh coordination layer.
//!
//! Exposes flow control (start, inspect, cancel) and agent administration
//! (register, heartbeat, responses) over a JSON API built with axum.

/// API error type and its HTTP mapping.
pub mod error;
/// Request handlers.
pub mod handlers;
/// Router construction.
pub mod server;

pub use error::ApiError;
pub use server::{AppState, GatewayServer};
