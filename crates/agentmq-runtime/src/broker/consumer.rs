//! Consumer / worker harness.
//!
//! Pulls deliveries from the per-org request queue and drives each one
//! through the lifecycle: decode, idempotency gate, handler invocation
//! under a deadline, then completion, retry scheduling, quarantine, or
//! dead-lettering. Every transition enqueues an audit record and the
//! terminal outcome is streamed back to the originating agent.
//!
//! Acks are issued exactly once per delivery, after the routing decision
//! is durable. A crash between decision and ack causes broker redelivery,
//! which the idempotency store neutralizes.

use std::sync::Arc;
use std::time::Duration;

use futures_lite::stream::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ConfirmSelectOptions,
    },
    types::FieldTable,
    Channel, Connection,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use agentmq_core::config::QueueConfig;
use agentmq_core::envelope::MessageEnvelope;
use agentmq_core::error::{HandlerError, QueueError};
use agentmq_core::handler::{HandlerContext, HandlerRegistry, ResponseSink};
use agentmq_core::lifecycle::{events, MessageStatus};
use agentmq_core::limiter::InFlightTracker;
use agentmq_core::response::ResponsePayload;
use agentmq_core::retry::RetryPolicy;

use super::streamer::ResponseStreamer;
use super::{headers, open_channel, publisher, topology};
use crate::db::audit::AuditHandle;
use crate::db::idempotency::{IdempotencyStore, MarkOutcome};
use crate::db::poison::PoisonStore;
use crate::metrics;

/// Routing decision for a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureDisposition {
    Quarantine,
    Retry,
    DeadLetter,
}

fn failure_disposition(
    policy: &RetryPolicy,
    retry_count: u32,
    quarantined: bool,
) -> FailureDisposition {
    if quarantined {
        FailureDisposition::Quarantine
    } else if !policy.is_exhausted(retry_count) {
        FailureDisposition::Retry
    } else {
        FailureDisposition::DeadLetter
    }
}

/// What to do with the broker delivery once processing settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryDisposition {
    Ack,
    NackRequeue,
}

/// Per-org worker pulling from `org.<org>.requests.q`.
pub struct ConsumerHarness {
    channel: Channel,
    org_id: String,
    registry: Arc<HandlerRegistry>,
    idempotency: Arc<dyn IdempotencyStore>,
    poison: Arc<dyn PoisonStore>,
    audit: AuditHandle,
    streamer: Arc<ResponseStreamer>,
    retry: RetryPolicy,
    deadline: Duration,
    prefetch: u16,
    in_flight: InFlightTracker,
    shutdown: CancellationToken,
}

impl ConsumerHarness {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        connection: &Connection,
        org_id: impl Into<String>,
        config: &QueueConfig,
        registry: Arc<HandlerRegistry>,
        idempotency: Arc<dyn IdempotencyStore>,
        poison: Arc<dyn PoisonStore>,
        audit: AuditHandle,
        streamer: Arc<ResponseStreamer>,
        shutdown: CancellationToken,
    ) -> Result<Self, QueueError> {
        let channel = open_channel(connection).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Broker {
                message: format!("Failed to enable confirms on consumer channel: {}", e),
            })?;
        Ok(Self {
            channel,
            org_id: org_id.into(),
            registry,
            idempotency,
            poison,
            audit,
            streamer,
            retry: config.retry.clone(),
            deadline: Duration::from_millis(config.consumer.handler_deadline_ms),
            prefetch: config.rate_limit.org_max_in_flight,
            in_flight: InFlightTracker::new(),
            shutdown,
        })
    }

    /// Declare topology, then consume until shutdown or stream end.
    pub async fn run(&self) -> Result<(), QueueError> {
        topology::declare_org_topology(&self.channel, &self.org_id).await?;
        topology::declare_org_retry_topology(&self.channel, &self.org_id, &self.retry.delays_ms)
            .await?;
        topology::declare_org_dlq_topology(&self.channel, &self.org_id).await?;

        self.channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Broker {
                message: format!("Failed to set prefetch: {}", e),
            })?;

        let mut consumer = self
            .channel
            .basic_consume(
                &topology::request_queue(&self.org_id),
                &format!("agentmq-worker-{}", self.org_id),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Broker {
                message: format!("Failed to start consuming: {}", e),
            })?;

        tracing::info!(org_id = %self.org_id, prefetch = self.prefetch, "consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let permit = self.in_flight.enter(&self.org_id);
                        let gauge = metrics::INFLIGHT_MESSAGES.with_label_values(&[&self.org_id]);
                        gauge.set(self.in_flight.in_flight(&self.org_id) as i64);
                        self.process_delivery(delivery).await;
                        drop(permit);
                        gauge.set(self.in_flight.in_flight(&self.org_id) as i64);
                    }
                    Some(Err(e)) => {
                        return Err(QueueError::Broker {
                            message: format!("Consume stream failed: {}", e),
                        });
                    }
                    None => break,
                }
            }
        }

        tracing::info!(org_id = %self.org_id, "consumer stopped");
        Ok(())
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let retry_count = headers::retry_count(&delivery.properties);
        let first_seen_at = headers::first_seen_at(&delivery.properties);
        let trace_context = headers::trace_context(&delivery.properties);
        let redelivered = delivery.redelivered;

        // 1. Decode and re-validate. Malformed bodies are terminal.
        let envelope = match MessageEnvelope::from_bytes(&delivery.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.audit.event(
                    None,
                    &self.org_id,
                    events::FAILED,
                    Some(json!({"reason": "invalid_envelope", "error": e.to_string()})),
                );
                metrics::MESSAGES_CONSUMED_TOTAL
                    .with_label_values(&[&self.org_id, "invalid_envelope"])
                    .inc();
                self.ack(&delivery).await;
                return;
            }
        };

        let dedup_key = envelope.dedup_key();
        let sink = envelope
            .agent_id
            .as_deref()
            .map(|agent| Arc::clone(&self.streamer).sink_for(agent));

        // 2. Idempotency gate. Retried deliveries carry x-retry-count > 0
        // and continue the chain that already claimed the key.
        if retry_count == 0 {
            let outcome = self
                .idempotency
                .mark_and_check(&envelope.org_id, &dedup_key)
                .await;
            if outcome == MarkOutcome::Duplicate {
                self.audit.event(
                    Some(envelope.message_id),
                    &envelope.org_id,
                    events::DUPLICATE_SKIPPED,
                    Some(json!({"dedup_key": dedup_key})),
                );
                self.audit.state(&envelope, MessageStatus::Duplicate);
                self.emit_error(
                    sink.as_ref(),
                    &envelope,
                    "DuplicateMessage",
                    &format!("dedup key {} was already processed", dedup_key),
                )
                .await;
                metrics::DUPLICATES_SKIPPED_TOTAL
                    .with_label_values(&[&envelope.org_id])
                    .inc();
                metrics::MESSAGES_CONSUMED_TOTAL
                    .with_label_values(&[&envelope.org_id, "duplicate"])
                    .inc();
                self.ack(&delivery).await;
                return;
            }
        }

        // 3. Transition to PROCESSING and acknowledge to the agent.
        self.audit
            .event(Some(envelope.message_id), &envelope.org_id, events::DEQUEUED, None);
        self.audit.event(
            Some(envelope.message_id),
            &envelope.org_id,
            events::PROCESSING,
            Some(json!({"retry_count": retry_count})),
        );
        self.audit.state(&envelope, MessageStatus::Processing);
        if let Some(sink) = &sink {
            if let Err(e) = sink.emit(ResponsePayload::acknowledgment(&envelope)).await {
                tracing::warn!(message_id = %envelope.message_id, "failed to publish acknowledgment: {}", e);
            }
        }

        // 4. Run the handler under the per-message deadline; cancellation
        // propagates through the context token and counts as transient.
        let cancellation = self.shutdown.child_token();
        let ctx = HandlerContext::new(envelope.clone(), cancellation.clone(), sink.clone());
        let outcome = match self.registry.get(&envelope.message_type) {
            None => Err(HandlerError::fatal(format!(
                "no handler registered for type {:?}",
                envelope.message_type
            ))),
            Some(handler) => {
                match tokio::time::timeout(self.deadline, handler.handle(&ctx, &envelope)).await {
                    Ok(result) => result,
                    Err(_) => {
                        cancellation.cancel();
                        Err(HandlerError::transient(format!(
                            "handler deadline of {} ms exceeded",
                            self.deadline.as_millis()
                        )))
                    }
                }
            }
        };

        let disposition = match outcome {
            Ok(result) => {
                self.complete(&envelope, &ctx, sink.as_ref(), result).await;
                DeliveryDisposition::Ack
            }
            Err(error) if error.is_retryable() => {
                self.handle_transient(
                    &envelope,
                    retry_count,
                    &first_seen_at,
                    trace_context.as_deref(),
                    sink.as_ref(),
                    &error,
                    redelivered,
                )
                .await
            }
            Err(error) => {
                self.handle_fatal(
                    &envelope,
                    retry_count,
                    &first_seen_at,
                    sink.as_ref(),
                    &error,
                    redelivered,
                )
                .await
            }
        };

        match disposition {
            DeliveryDisposition::Ack => self.ack(&delivery).await,
            DeliveryDisposition::NackRequeue => self.nack_requeue(&delivery).await,
        }
    }

    /// Step 5: success path.
    async fn complete(
        &self,
        envelope: &MessageEnvelope,
        ctx: &HandlerContext,
        sink: Option<&Arc<dyn ResponseSink>>,
        result: serde_json::Value,
    ) {
        self.audit
            .event(Some(envelope.message_id), &envelope.org_id, events::COMPLETED, None);
        self.audit.state(envelope, MessageStatus::Completed);

        if let Some(sink) = sink {
            let chunks = ctx.chunks_emitted();
            if chunks > 0 {
                if let Err(e) = sink
                    .emit(ResponsePayload::stream_complete(envelope, chunks))
                    .await
                {
                    tracing::warn!(message_id = %envelope.message_id, "failed to publish stream_complete: {}", e);
                }
            }
            if let Err(e) = sink.emit(ResponsePayload::result(envelope, result)).await {
                tracing::warn!(message_id = %envelope.message_id, "failed to publish result: {}", e);
            }
        }

        self.poison
            .reset(&envelope.org_id, &envelope.dedup_key())
            .await;
        metrics::MESSAGES_CONSUMED_TOTAL
            .with_label_values(&[&envelope.org_id, "completed"])
            .inc();
    }

    /// Step 6: transient failure routes to quarantine, retry, or DLQ.
    #[allow(clippy::too_many_arguments)]
    async fn handle_transient(
        &self,
        envelope: &MessageEnvelope,
        retry_count: u32,
        first_seen_at: &str,
        trace_context: Option<&str>,
        sink: Option<&Arc<dyn ResponseSink>>,
        error: &HandlerError,
        redelivered: bool,
    ) -> DeliveryDisposition {
        let dedup_key = envelope.dedup_key();
        let failures = self
            .poison
            .increment_failure(&envelope.org_id, &dedup_key)
            .await;
        let quarantined = self
            .poison
            .should_quarantine(&envelope.org_id, &dedup_key)
            .await;

        match failure_disposition(&self.retry, retry_count, quarantined) {
            FailureDisposition::Quarantine => {
                self.audit.event(
                    Some(envelope.message_id),
                    &envelope.org_id,
                    events::POISON_QUARANTINED,
                    Some(json!({"failures": failures, "error": error.message()})),
                );
                self.audit.state(envelope, MessageStatus::Quarantined);
                self.audit.dlq(
                    &envelope.org_id,
                    serde_json::to_value(envelope).unwrap_or_default(),
                    json!({"type": "PoisonQuarantine", "message": error.message(), "failures": failures}),
                    false,
                );
                self.emit_error(sink, envelope, "PoisonQuarantine", error.message())
                    .await;
                metrics::POISON_QUARANTINED_TOTAL
                    .with_label_values(&[&envelope.org_id])
                    .inc();
                metrics::MESSAGES_CONSUMED_TOTAL
                    .with_label_values(&[&envelope.org_id, "quarantined"])
                    .inc();
                self.publish_dlq_or_requeue(envelope, retry_count, first_seen_at, redelivered)
                    .await
            }
            FailureDisposition::Retry => {
                match publisher::schedule_retry(
                    &self.channel,
                    envelope,
                    retry_count,
                    &self.retry,
                    first_seen_at,
                    trace_context,
                )
                .await
                {
                    Ok(delay_ms) => {
                        self.audit.event(
                            Some(envelope.message_id),
                            &envelope.org_id,
                            events::RETRY_SCHEDULED,
                            Some(json!({
                                "retry_count": retry_count + 1,
                                "delay_ms": delay_ms,
                                "error": error.message(),
                            })),
                        );
                        self.audit.state(envelope, MessageStatus::Retrying);
                        metrics::MESSAGES_CONSUMED_TOTAL
                            .with_label_values(&[&envelope.org_id, "retrying"])
                            .inc();
                        DeliveryDisposition::Ack
                    }
                    Err(publish_err) if !redelivered => {
                        tracing::error!(
                            message_id = %envelope.message_id,
                            "retry publish failed, requeueing delivery: {}",
                            publish_err
                        );
                        DeliveryDisposition::NackRequeue
                    }
                    Err(publish_err) => {
                        tracing::error!(
                            message_id = %envelope.message_id,
                            "retry publish failed on redelivery, dead-lettering: {}",
                            publish_err
                        );
                        self.dead_letter(
                            envelope,
                            retry_count,
                            first_seen_at,
                            sink,
                            error.kind(),
                            error.message(),
                            redelivered,
                        )
                        .await
                    }
                }
            }
            FailureDisposition::DeadLetter => {
                self.dead_letter(
                    envelope,
                    retry_count,
                    first_seen_at,
                    sink,
                    error.kind(),
                    error.message(),
                    redelivered,
                )
                .await
            }
        }
    }

    /// Step 7: fatal failures audit `failed`, then dead-letter.
    async fn handle_fatal(
        &self,
        envelope: &MessageEnvelope,
        retry_count: u32,
        first_seen_at: &str,
        sink: Option<&Arc<dyn ResponseSink>>,
        error: &HandlerError,
        redelivered: bool,
    ) -> DeliveryDisposition {
        self.audit.event(
            Some(envelope.message_id),
            &envelope.org_id,
            events::FAILED,
            Some(json!({"type": error.kind(), "message": error.message()})),
        );
        self.dead_letter(
            envelope,
            retry_count,
            first_seen_at,
            sink,
            error.kind(),
            error.message(),
            redelivered,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn dead_letter(
        &self,
        envelope: &MessageEnvelope,
        retry_count: u32,
        first_seen_at: &str,
        sink: Option<&Arc<dyn ResponseSink>>,
        kind: &str,
        message: &str,
        redelivered: bool,
    ) -> DeliveryDisposition {
        self.audit.event(
            Some(envelope.message_id),
            &envelope.org_id,
            events::DEAD_LETTER,
            Some(json!({"type": kind, "message": message, "retry_count": retry_count})),
        );
        self.audit.state(envelope, MessageStatus::DeadLettered);
        self.audit.dlq(
            &envelope.org_id,
            serde_json::to_value(envelope).unwrap_or_default(),
            json!({"type": kind, "message": message}),
            true,
        );
        self.emit_error(sink, envelope, kind, message).await;
        metrics::MESSAGES_CONSUMED_TOTAL
            .with_label_values(&[&envelope.org_id, "dead_lettered"])
            .inc();
        self.publish_dlq_or_requeue(envelope, retry_count, first_seen_at, redelivered)
            .await
    }

    /// Broker publish failures inside the harness requeue the delivery
    /// once; a second failure acks to avoid a poison loop, with the audit
    /// rows already enqueued.
    async fn publish_dlq_or_requeue(
        &self,
        envelope: &MessageEnvelope,
        retry_count: u32,
        first_seen_at: &str,
        redelivered: bool,
    ) -> DeliveryDisposition {
        match publisher::publish_to_dlq(&self.channel, envelope, retry_count, first_seen_at).await {
            Ok(()) => DeliveryDisposition::Ack,
            Err(e) if !redelivered => {
                tracing::error!(
                    message_id = %envelope.message_id,
                    "DLQ publish failed, requeueing delivery: {}",
                    e
                );
                DeliveryDisposition::NackRequeue
            }
            Err(e) => {
                tracing::error!(
                    message_id = %envelope.message_id,
                    "DLQ publish failed on redelivery, acking: {}",
                    e
                );
                DeliveryDisposition::Ack
            }
        }
    }

    async fn emit_error(
        &self,
        sink: Option<&Arc<dyn ResponseSink>>,
        envelope: &MessageEnvelope,
        kind: &str,
        message: &str,
    ) {
        if let Some(sink) = sink {
            if let Err(e) = sink
                .emit(ResponsePayload::error(Some(envelope), kind, message))
                .await
            {
                tracing::warn!(message_id = %envelope.message_id, "failed to publish error payload: {}", e);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            tracing::error!("failed to ack delivery: {}", e);
        }
    }

    async fn nack_requeue(&self, delivery: &Delivery) {
        let options = BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
        };
        if let Err(e) = delivery.nack(options).await {
            tracing::error!("failed to nack delivery: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn test_quarantine_wins_over_retry() {
        assert_eq!(
            failure_disposition(&policy(), 0, true),
            FailureDisposition::Quarantine
        );
        assert_eq!(
            failure_disposition(&policy(), 4, true),
            FailureDisposition::Quarantine
        );
    }

    #[test]
    fn test_retry_until_budget_spent() {
        for retry_count in 0..4 {
            assert_eq!(
                failure_disposition(&policy(), retry_count, false),
                FailureDisposition::Retry
            );
        }
        assert_eq!(
            failure_disposition(&policy(), 4, false),
            FailureDisposition::DeadLetter
        );
        assert_eq!(
            failure_disposition(&policy(), 7, false),
            FailureDisposition::DeadLetter
        );
    }
}
