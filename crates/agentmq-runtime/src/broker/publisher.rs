//! Publishing into the per-org priority exchanges, the retry ladder, and
//! the dead-letter queue.
//!
//! Requests publish persistent with broker-level priority equal to the
//! envelope priority. Publisher confirms are awaited for priority > 0;
//! batches fire every publish on one channel and await a single confirm
//! barrier at the end, returning per-item outcomes.

use chrono::Utc;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::{Confirmation, PublisherConfirm},
    BasicProperties, Channel, Connection,
};

use agentmq_core::config::RateLimitConfig;
use agentmq_core::envelope::MessageEnvelope;
use agentmq_core::error::QueueError;
use agentmq_core::lifecycle::{events, MessageStatus};
use agentmq_core::limiter::OrgRateLimiter;
use agentmq_core::retry::RetryPolicy;

use super::{headers, open_channel, topology};
use crate::db::audit::AuditHandle;
use crate::metrics;

pub(crate) async fn publish_json(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<PublisherConfirm, QueueError> {
    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await
        .map_err(|e| QueueError::Broker {
            message: format!("Failed to publish to {}: {}", exchange, e),
        })
}

pub(crate) async fn await_confirmation(
    confirm: PublisherConfirm,
    exchange: &str,
) -> Result<(), QueueError> {
    match confirm.await {
        Ok(Confirmation::Nack(_)) => Err(QueueError::Broker {
            message: format!("Broker nacked publish to {}", exchange),
        }),
        Ok(_) => Ok(()),
        Err(e) => Err(QueueError::Broker {
            message: format!("Publish confirm failed for {}: {}", exchange, e),
        }),
    }
}

fn request_properties(
    envelope: &MessageEnvelope,
    retry_count: u32,
    first_seen_at: &str,
    trace_context: Option<&str>,
) -> BasicProperties {
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_priority(envelope.priority)
        .with_message_id(envelope.message_id.to_string().into())
        .with_headers(headers::build(retry_count, first_seen_at, trace_context))
}

/// Publisher for org request exchanges, with per-org admission control.
pub struct RequestPublisher {
    channel: Channel,
    limiter: Option<OrgRateLimiter>,
    audit: Option<AuditHandle>,
}

impl RequestPublisher {
    pub async fn new(
        connection: &Connection,
        rate_limit: &RateLimitConfig,
    ) -> Result<Self, QueueError> {
        let channel = open_channel(connection).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Broker {
                message: format!("Failed to enable publisher confirms: {}", e),
            })?;
        let limiter = rate_limit
            .org_rate_limit
            .map(|rate| OrgRateLimiter::new(rate, rate_limit.effective_burst().unwrap_or(1)));
        Ok(Self {
            channel,
            limiter,
            audit: None,
        })
    }

    /// Record `created`/`enqueued` events and the QUEUED state snapshot
    /// for every accepted publish.
    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit_enqueued(&self, org_id: &str, envelope: &MessageEnvelope) {
        if let Some(audit) = &self.audit {
            audit.event(Some(envelope.message_id), org_id, events::CREATED, None);
            audit.event(Some(envelope.message_id), org_id, events::ENQUEUED, None);
            audit.state(envelope, MessageStatus::Queued);
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn admit(&self, org_id: &str) -> Result<(), QueueError> {
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire(org_id) {
                metrics::RATE_LIMITED_TOTAL
                    .with_label_values(&[org_id])
                    .inc();
                return Err(QueueError::RateLimited {
                    org_id: org_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Publish one request; awaits the broker confirm for priority > 0.
    pub async fn publish_request(
        &self,
        org_id: &str,
        envelope: &MessageEnvelope,
    ) -> Result<(), QueueError> {
        self.admit(org_id)?;
        let exchange = topology::request_exchange(org_id);
        let properties = request_properties(
            envelope,
            0,
            &Utc::now().to_rfc3339(),
            envelope.trace_context(),
        );
        let confirm = publish_json(
            &self.channel,
            &exchange,
            org_id,
            &envelope.to_bytes()?,
            properties,
        )
        .await?;
        if envelope.priority > 0 {
            await_confirmation(confirm, &exchange).await?;
        }
        self.audit_enqueued(org_id, envelope);
        metrics::MESSAGES_PUBLISHED_TOTAL
            .with_label_values(&[org_id])
            .inc();
        Ok(())
    }

    /// Publish a batch on one channel with a single confirm barrier at the
    /// end; partial failure yields per-item outcomes.
    pub async fn publish_requests_batch(
        &self,
        org_id: &str,
        envelopes: &[MessageEnvelope],
    ) -> Result<Vec<Result<(), QueueError>>, QueueError> {
        let exchange = topology::request_exchange(org_id);
        let first_seen_at = Utc::now().to_rfc3339();

        let mut pending: Vec<Result<PublisherConfirm, QueueError>> =
            Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            if let Err(denied) = self.admit(org_id) {
                pending.push(Err(denied));
                continue;
            }
            let properties =
                request_properties(envelope, 0, &first_seen_at, envelope.trace_context());
            let body = match envelope.to_bytes() {
                Ok(body) => body,
                Err(e) => {
                    pending.push(Err(e));
                    continue;
                }
            };
            pending.push(publish_json(&self.channel, &exchange, org_id, &body, properties).await);
        }

        // Confirm barrier: every in-flight publish settles before we return.
        let mut outcomes = Vec::with_capacity(pending.len());
        for (envelope, item) in envelopes.iter().zip(pending) {
            match item {
                Ok(confirm) => {
                    let outcome = await_confirmation(confirm, &exchange).await;
                    if outcome.is_ok() {
                        self.audit_enqueued(org_id, envelope);
                        metrics::MESSAGES_PUBLISHED_TOTAL
                            .with_label_values(&[org_id])
                            .inc();
                    }
                    outcomes.push(outcome);
                }
                Err(e) => outcomes.push(Err(e)),
            }
        }
        Ok(outcomes)
    }
}

/// Republish into the retry ladder, carrying `retry_count + 1`.
///
/// The bucket queue's TTL fixes the base delay; when jitter is configured
/// a per-message expiration draws the realized delay inside the jitter
/// window. Returns the scheduled delay in milliseconds.
pub async fn schedule_retry(
    channel: &Channel,
    envelope: &MessageEnvelope,
    retry_count: u32,
    policy: &RetryPolicy,
    first_seen_at: &str,
    trace_context: Option<&str>,
) -> Result<u64, QueueError> {
    let bucket = policy.bucket_ms(retry_count);
    let delay_ms = policy.next_delay_ms(retry_count);
    let exchange = topology::retry_exchange(&envelope.org_id);

    let mut properties =
        request_properties(envelope, retry_count + 1, first_seen_at, trace_context);
    if policy.jitter > 0.0 {
        properties = properties.with_expiration(delay_ms.to_string().into());
    }

    let confirm = publish_json(
        channel,
        &exchange,
        &topology::retry_routing_key(bucket),
        &envelope.to_bytes()?,
        properties,
    )
    .await?;
    await_confirmation(confirm, &exchange).await?;

    metrics::RETRIES_SCHEDULED_TOTAL
        .with_label_values(&[&envelope.org_id])
        .inc();
    Ok(delay_ms)
}

/// Publish a terminally failed message to the org dead-letter queue.
pub async fn publish_to_dlq(
    channel: &Channel,
    envelope: &MessageEnvelope,
    retry_count: u32,
    first_seen_at: &str,
) -> Result<(), QueueError> {
    let exchange = topology::dlq_exchange(&envelope.org_id);
    let properties = request_properties(envelope, retry_count, first_seen_at, None);
    let confirm = publish_json(
        channel,
        &exchange,
        &envelope.org_id,
        &envelope.to_bytes()?,
        properties,
    )
    .await?;
    await_confirmation(confirm, &exchange).await?;

    metrics::DLQ_MESSAGES_TOTAL
        .with_label_values(&[&envelope.org_id])
        .inc();
    Ok(())
}
