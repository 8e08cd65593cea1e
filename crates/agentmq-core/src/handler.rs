//! Handler capability trait and per-type dispatch.
//!
//! Handlers are registered by message type and invoked by the consumer
//! harness with a context carrying the cancellation token and the response
//! sink. Outcomes are values ([`HandlerError::Transient`] /
//! [`HandlerError::Fatal`]), never panics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::envelope::MessageEnvelope;
use crate::error::{HandlerError, QueueError};
use crate::response::ResponsePayload;

/// Destination for intermediate response payloads (progress, chunks).
///
/// Implemented by the runtime's response streamer; absent when the
/// envelope has no `agent_id`.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn emit(&self, payload: ResponsePayload) -> Result<(), QueueError>;
}

/// Per-delivery context handed to the handler.
pub struct HandlerContext {
    origin: MessageEnvelope,
    cancellation: CancellationToken,
    sink: Option<Arc<dyn ResponseSink>>,
    chunks_emitted: AtomicU32,
}

impl HandlerContext {
    pub fn new(
        origin: MessageEnvelope,
        cancellation: CancellationToken,
        sink: Option<Arc<dyn ResponseSink>>,
    ) -> Self {
        Self {
            origin,
            cancellation,
            sink,
            chunks_emitted: AtomicU32::new(0),
        }
    }

    /// Cancelled when the per-message deadline fires or shutdown begins.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Emit a progress payload; no-op when the message has no agent queue.
    pub async fn send_progress(&self, progress: u32, status: &str) -> Result<(), QueueError> {
        self.emit(ResponsePayload::progress(&self.origin, progress, status))
            .await
    }

    /// Emit the next stream chunk; chunk indices are assigned in order.
    pub async fn send_chunk(&self, chunk: &str) -> Result<(), QueueError> {
        let index = self.chunks_emitted.fetch_add(1, Ordering::SeqCst);
        self.emit(ResponsePayload::stream_chunk(&self.origin, chunk, index))
            .await
    }

    /// Chunks emitted so far; the harness uses this for `stream_complete`.
    pub fn chunks_emitted(&self) -> u32 {
        self.chunks_emitted.load(Ordering::SeqCst)
    }

    async fn emit(&self, payload: ResponsePayload) -> Result<(), QueueError> {
        match &self.sink {
            Some(sink) => sink.emit(payload).await,
            None => Ok(()),
        }
    }
}

/// Processing capability invoked for each delivery of a message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        envelope: &MessageEnvelope,
    ) -> Result<Value, HandlerError>;
}

/// Dispatch table from message type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(message_type.into(), handler);
    }

    pub fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct RecordingSink {
        payloads: Mutex<Vec<ResponsePayload>>,
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn emit(&self, payload: ResponsePayload) -> Result<(), QueueError> {
            self.payloads.lock().await.push(payload);
            Ok(())
        }
    }

    struct OkHandler;

    #[async_trait]
    impl MessageHandler for OkHandler {
        async fn handle(
            &self,
            _ctx: &HandlerContext,
            _envelope: &MessageEnvelope,
        ) -> Result<Value, HandlerError> {
            Ok(json!({"ok": true}))
        }
    }

    fn origin() -> MessageEnvelope {
        MessageEnvelope::validate(&json!({
            "message_id": "9f0c2d0a-0b1e-4c3d-8e4f-5a6b7c8d9e0f",
            "version": "1.0.0",
            "org_id": "demo-org",
            "agent_id": "demo-agent",
            "type": "agent_message",
            "created_by": {"type": "system", "id": "test"},
            "created_at": "2025-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry.register("agent_message", Arc::new(OkHandler));
        assert!(registry.get("agent_message").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[tokio::test]
    async fn test_chunk_indices_increase() {
        let sink = Arc::new(RecordingSink {
            payloads: Mutex::new(Vec::new()),
        });
        let ctx = HandlerContext::new(origin(), CancellationToken::new(), Some(sink.clone()));

        ctx.send_chunk("a").await.unwrap();
        ctx.send_chunk("b").await.unwrap();
        ctx.send_chunk("c").await.unwrap();
        assert_eq!(ctx.chunks_emitted(), 3);

        let payloads = sink.payloads.lock().await;
        let indices: Vec<u32> = payloads
            .iter()
            .map(|p| match p {
                ResponsePayload::StreamChunk { chunk_index, .. } => *chunk_index,
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_emit_without_sink_is_noop() {
        let ctx = HandlerContext::new(origin(), CancellationToken::new(), None);
        ctx.send_progress(50, "halfway").await.unwrap();
        ctx.send_chunk("ignored").await.unwrap();
        assert_eq!(ctx.chunks_emitted(), 1);
    }
}
