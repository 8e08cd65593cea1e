//! Broker topology: per-org request, retry, and DLQ exchanges/queues,
//! plus per-agent response streams.
//!
//! The generated names are the stable contract with producers and agents.
//! Declarations are idempotent: repeated calls with identical arguments
//! are no-ops, while a mismatched re-declaration fails the channel with a
//! precondition error that callers must treat as fatal at startup.

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

use agentmq_core::envelope::MAX_PRIORITY;
use agentmq_core::error::QueueError;

pub fn request_exchange(org_id: &str) -> String {
    format!("org.{}.requests.x", org_id)
}

pub fn request_queue(org_id: &str) -> String {
    format!("org.{}.requests.q", org_id)
}

pub fn retry_exchange(org_id: &str) -> String {
    format!("org.{}.retry.x", org_id)
}

pub fn retry_queue(org_id: &str, delay_ms: u64) -> String {
    format!("org.{}.retry.{}.q", org_id, delay_ms)
}

/// Routing key selecting the delay bucket on the retry exchange.
pub fn retry_routing_key(delay_ms: u64) -> String {
    delay_ms.to_string()
}

pub fn dlq_exchange(org_id: &str) -> String {
    format!("org.{}.dlq.x", org_id)
}

pub fn dlq_queue(org_id: &str) -> String {
    format!("org.{}.dlq.q", org_id)
}

pub fn response_exchange(agent_id: &str) -> String {
    format!("agent.{}.responses.x", agent_id)
}

pub fn response_queue(agent_id: &str) -> String {
    format!("agent.{}.responses.q", agent_id)
}

fn broker_err(context: &str, e: lapin::Error) -> QueueError {
    QueueError::Broker {
        message: format!("{}: {}", context, e),
    }
}

async fn declare_exchange(channel: &Channel, name: &str) -> Result<(), QueueError> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_err(&format!("Failed to declare exchange {}", name), e))
}

async fn declare_queue(
    channel: &Channel,
    name: &str,
    args: FieldTable,
) -> Result<(), QueueError> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            args,
        )
        .await
        .map(|_| ())
        .map_err(|e| broker_err(&format!("Failed to declare queue {}", name), e))
}

async fn bind_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), QueueError> {
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_err(&format!("Failed to bind {} to {}", queue, exchange), e))
}

/// Declare the per-org priority request exchange and queue.
pub async fn declare_org_topology(channel: &Channel, org_id: &str) -> Result<(), QueueError> {
    declare_exchange(channel, &request_exchange(org_id)).await?;

    let mut args = FieldTable::default();
    args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(MAX_PRIORITY));
    declare_queue(channel, &request_queue(org_id), args).await?;
    bind_queue(channel, &request_queue(org_id), &request_exchange(org_id), org_id).await?;

    tracing::debug!(org_id, "declared request topology");
    Ok(())
}

/// Declare the per-org retry exchange and one TTL delay queue per ladder
/// entry, each dead-lettering back into the request exchange.
pub async fn declare_org_retry_topology(
    channel: &Channel,
    org_id: &str,
    delays_ms: &[u64],
) -> Result<(), QueueError> {
    declare_exchange(channel, &retry_exchange(org_id)).await?;

    for &delay_ms in delays_ms {
        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongInt(delay_ms as i32));
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(request_exchange(org_id).into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(org_id.to_string().into()),
        );
        let queue = retry_queue(org_id, delay_ms);
        declare_queue(channel, &queue, args).await?;
        bind_queue(
            channel,
            &queue,
            &retry_exchange(org_id),
            &retry_routing_key(delay_ms),
        )
        .await?;
    }

    tracing::debug!(org_id, buckets = delays_ms.len(), "declared retry topology");
    Ok(())
}

/// Declare the per-org dead-letter exchange and queue (no consumer by
/// default).
pub async fn declare_org_dlq_topology(channel: &Channel, org_id: &str) -> Result<(), QueueError> {
    declare_exchange(channel, &dlq_exchange(org_id)).await?;
    declare_queue(channel, &dlq_queue(org_id), FieldTable::default()).await?;
    bind_queue(channel, &dlq_queue(org_id), &dlq_exchange(org_id), org_id).await?;
    tracing::debug!(org_id, "declared DLQ topology");
    Ok(())
}

/// Declare the per-agent response exchange and queue.
pub async fn declare_agent_response_topology(
    channel: &Channel,
    agent_id: &str,
) -> Result<(), QueueError> {
    declare_exchange(channel, &response_exchange(agent_id)).await?;
    declare_queue(channel, &response_queue(agent_id), FieldTable::default()).await?;
    bind_queue(
        channel,
        &response_queue(agent_id),
        &response_exchange(agent_id),
        agent_id,
    )
    .await?;
    tracing::debug!(agent_id, "declared agent response topology");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_names_are_stable() {
        assert_eq!(request_exchange("acme"), "org.acme.requests.x");
        assert_eq!(request_queue("acme"), "org.acme.requests.q");
        assert_eq!(retry_exchange("acme"), "org.acme.retry.x");
        assert_eq!(retry_queue("acme", 4000), "org.acme.retry.4000.q");
        assert_eq!(dlq_exchange("acme"), "org.acme.dlq.x");
        assert_eq!(dlq_queue("acme"), "org.acme.dlq.q");
        assert_eq!(response_exchange("agent-1"), "agent.agent-1.responses.x");
        assert_eq!(response_queue("agent-1"), "agent.agent-1.responses.q");
    }

    #[test]
    fn test_retry_routing_key_is_the_bucket() {
        assert_eq!(retry_routing_key(1000), "1000");
        assert_eq!(retry_routing_key(8000), "8000");
    }
}
