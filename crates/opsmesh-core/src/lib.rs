//! Core types and error definitions for the OpsMesh coordination layer.
//!
//! This crate provides the protocol shared by every OpsMesh crate: the error
//! taxonomy, the messages agents exchange, and the agent record kept by the
//! registry.
//!
//! # Main types
//!
//! - [`OpsMeshError`] — Unified error enum for all OpsMesh subsystems.
//! - [`OpsMeshResult`] — Convenience alias for `Result<T, OpsMeshError>`.
//! - [`Message`] — Sum type of everything carried between agents.
//! - [`TaskRequest`] / [`TaskResponse`] — Work requested of an agent and its answer.
//! - [`AgentRecord`] — A registered agent with its capabilities and liveness.

/// Agent records and liveness status.
pub mod agent;
/// Error taxonomy.
pub mod error;
/// Protocol messages.
pub mod message;

pub use agent::{AgentRecord, AgentStatus, LOCAL_ENDPOINT_SCHEME};
pub use error::{OpsMeshError, OpsMeshResult};
pub use message::{
    DeliveryId, Heartbeat, Message, MessagePriority, Notification, Payload, TaskRequest,
    TaskResponse, TaskStatus,
};
