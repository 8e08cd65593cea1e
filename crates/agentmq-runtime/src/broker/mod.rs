//! AMQP broker plane built on lapin.
//!
//! Connections are process-wide, one per role (publisher, consumer);
//! channels are per-task. All topology names are produced by the pure
//! builders in [`topology`].

pub mod consumer;
pub mod headers;
pub mod publisher;
pub mod streamer;
pub mod topology;

use lapin::{Connection, ConnectionProperties};

use agentmq_core::error::QueueError;

/// Open a broker connection for one role.
pub async fn connect(url: &str) -> Result<Connection, QueueError> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(|e| QueueError::Broker {
            message: format!("Failed to connect to broker: {}", e),
        })
}

/// Create a channel on an existing connection.
pub async fn open_channel(connection: &Connection) -> Result<lapin::Channel, QueueError> {
    connection
        .create_channel()
        .await
        .map_err(|e| QueueError::Broker {
            message: format!("Failed to create channel: {}", e),
        })
}
