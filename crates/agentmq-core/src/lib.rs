//! # AgentMQ Core
//!
//! This crate provides the core message-queue primitives including:
//! - Message envelope schema and pure validation
//! - Lifecycle states and audit event names
//! - Error taxonomy shared across the publisher, consumer, and stores
//! - Retry policy (delay ladder with optional jitter)
//! - Response payload builders for agent response streams
//! - Per-org token-bucket rate limiting and in-flight tracking
//! - Handler capability trait and registry
//!
//! Everything in this crate is broker- and database-agnostic; the
//! `agentmq-runtime` crate wires these primitives to AMQP and Postgres.
//!
//! ## Core Concepts
//!
//! - **Envelope**: the validated, immutable message that enters the broker
//! - **Dedup key**: logical identity for idempotency, defaults to the
//!   message id
//! - **Handler**: processing capability registered by message type; its
//!   outcome (`Ok` / transient / fatal) drives the retry and dead-letter
//!   routing decisions

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod limiter;
pub mod response;
pub mod retry;

// Re-export commonly used types
pub use envelope::{CreatedBy, MessageEnvelope};
pub use error::{HandlerError, QueueError, Result};
pub use handler::{HandlerContext, HandlerRegistry, MessageHandler, ResponseSink};
pub use lifecycle::MessageStatus;
pub use response::ResponsePayload;
pub use retry::RetryPolicy;

/// Current version of the agentmq core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        CreatedBy, HandlerContext, HandlerError, HandlerRegistry, MessageEnvelope, MessageHandler,
        MessageStatus, QueueError, ResponsePayload, ResponseSink, Result, RetryPolicy,
    };
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
    pub use uuid::Uuid;
}
