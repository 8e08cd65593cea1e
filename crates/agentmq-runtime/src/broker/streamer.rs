//! Response streaming to per-agent queues.
//!
//! All payloads for one `request_id` are published sequentially on this
//! streamer's channel, so broker FIFO-within-routing-key preserves the
//! `acknowledgment ≺ progress/chunks ≺ stream_complete ≺ result|error`
//! order at the consumer.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::{options::ConfirmSelectOptions, BasicProperties, Channel, Connection};
use tokio::sync::Mutex;

use agentmq_core::error::QueueError;
use agentmq_core::handler::ResponseSink;
use agentmq_core::response::ResponsePayload;

use super::publisher::{await_confirmation, publish_json};
use super::{open_channel, topology};

/// Publishes response payloads to agent response exchanges.
pub struct ResponseStreamer {
    channel: Channel,
    declared_agents: Mutex<HashSet<String>>,
}

impl ResponseStreamer {
    pub async fn new(connection: &Connection) -> Result<Self, QueueError> {
        let channel = open_channel(connection).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Broker {
                message: format!("Failed to enable confirms on response channel: {}", e),
            })?;
        Ok(Self {
            channel,
            declared_agents: Mutex::new(HashSet::new()),
        })
    }

    async fn ensure_topology(&self, agent_id: &str) -> Result<(), QueueError> {
        let mut declared = self.declared_agents.lock().await;
        if !declared.contains(agent_id) {
            topology::declare_agent_response_topology(&self.channel, agent_id).await?;
            declared.insert(agent_id.to_string());
        }
        Ok(())
    }

    /// Publish one payload to the agent's response queue, awaiting the
    /// confirm so successive payloads keep their order.
    pub async fn publish(
        &self,
        agent_id: &str,
        payload: &ResponsePayload,
    ) -> Result<(), QueueError> {
        self.ensure_topology(agent_id).await?;
        let exchange = topology::response_exchange(agent_id);
        let body = serde_json::to_vec(payload)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        let confirm = publish_json(&self.channel, &exchange, agent_id, &body, properties).await?;
        await_confirmation(confirm, &exchange).await?;
        tracing::debug!(
            agent_id,
            kind = payload.kind(),
            request_id = ?payload.request_id(),
            "published response payload"
        );
        Ok(())
    }

    /// Sink bound to one agent, handed to handler contexts.
    pub fn sink_for(self: Arc<Self>, agent_id: &str) -> Arc<dyn ResponseSink> {
        Arc::new(AgentSink {
            streamer: self,
            agent_id: agent_id.to_string(),
        })
    }
}

struct AgentSink {
    streamer: Arc<ResponseStreamer>,
    agent_id: String,
}

#[async_trait]
impl ResponseSink for AgentSink {
    async fn emit(&self, payload: ResponsePayload) -> Result<(), QueueError> {
        self.streamer.publish(&self.agent_id, &payload).await
    }
}
