//! # AgentMQ Runtime
//!
//! Broker and database plane for the message-queue control plane:
//! - AMQP topology declaration, publishing, and the consumer harness
//!   (`broker` module, built on lapin)
//! - Idempotency and poison stores, audit batching, and retention jobs
//!   (`db` module, built on Diesel/Postgres)
//! - Prometheus metrics (`metrics` module)
//!
//! The primitives wired here come from `agentmq-core`; nothing in this
//! crate defines message semantics on its own.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod broker;
pub mod db;
pub mod metrics;

pub use broker::consumer::ConsumerHarness;
pub use broker::publisher::RequestPublisher;
pub use broker::streamer::ResponseStreamer;
pub use db::audit::{AuditBatcher, AuditHandle, AuditWriter, PostgresAuditWriter};
pub use db::idempotency::{IdempotencyStore, MarkOutcome, PostgresIdempotencyStore};
pub use db::poison::{PoisonStore, PostgresPoisonStore};
pub use db::DbPool;
