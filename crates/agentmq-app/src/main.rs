//! `agentmq` command-line utilities.
//!
//! Operational entry points for the control plane: topology
//! initialization, the worker harness, retention cleanup, a load
//! generator, and response-queue inspection. Exits 0 on success and
//! non-zero on configuration or connection errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use lapin::options::BasicGetOptions;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentmq_core::config::{
    self, BrokerConfig, ConfigError, DatabaseConfig, QueueConfig, RateLimitConfig,
    RetentionConfig,
};
use agentmq_core::error::{HandlerError, QueueError};
use agentmq_core::handler::{HandlerContext, HandlerRegistry, MessageHandler};
use agentmq_core::lifecycle::{events, MessageStatus};
use agentmq_core::MessageEnvelope;

use agentmq_runtime::broker::{self, topology};
use agentmq_runtime::db::audit::{AuditBatch, AuditWriter};
use agentmq_runtime::db::models::{MessageEventRecord, MessageRecord};
use agentmq_runtime::db::{self, retention};
use agentmq_runtime::metrics;
use agentmq_runtime::{
    AuditBatcher, ConsumerHarness, PostgresAuditWriter, PostgresIdempotencyStore,
    PostgresPoisonStore, RequestPublisher, ResponseStreamer,
};

#[derive(Parser)]
#[command(name = "agentmq", version, about = "Multi-tenant message-queue control plane utilities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare per-org request/retry/DLQ topology and agent response queues
    InitTopology {
        /// Comma-separated org ids
        #[arg(long, value_delimiter = ',', required = true)]
        orgs: Vec<String>,
        /// Comma-separated agent ids to pre-create response queues for
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
    },
    /// Run the worker harness for one org until interrupted
    Consume {
        #[arg(long)]
        org: String,
        /// Concurrent in-flight deliveries; overrides ORG_MAX_IN_FLIGHT
        #[arg(long)]
        concurrency: Option<u16>,
    },
    /// Purge DLQ rows past the retention window
    CleanupDlq {
        /// Purge only this org's DLQ rows
        #[arg(long)]
        org_id: Option<String>,
    },
    /// Purge idempotency keys past their TTL
    CleanupIdempotency,
    /// Publish synthetic messages and report throughput
    LoadTest {
        #[arg(long)]
        org: String,
        #[arg(long, default_value_t = 100)]
        count: usize,
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
        #[arg(long, default_value_t = 2)]
        priority: u8,
    },
    /// Print one pending response payload for an agent, or {"empty": true}
    PeekResponses {
        #[arg(long)]
        agent_id: String,
    },
    /// Seed a synthetic message row plus created/enqueued events
    SeedAudit {
        #[arg(long, default_value = "demo-org")]
        org_id: String,
        #[arg(long)]
        message_id: Option<Uuid>,
    },
}

fn config_err(e: ConfigError) -> QueueError {
    QueueError::Configuration {
        message: e.to_string(),
    }
}

/// Demo handler registered for `agent_message`; echoes the payload back.
struct EchoHandler;

#[async_trait::async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(
        &self,
        _ctx: &HandlerContext,
        envelope: &MessageEnvelope,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(json!({"ok": true, "echo": envelope.payload}))
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), QueueError> {
    match command {
        Command::InitTopology { orgs, agents } => init_topology(orgs, agents).await,
        Command::Consume { org, concurrency } => consume(org, concurrency).await,
        Command::CleanupDlq { org_id } => cleanup_dlq(org_id).await,
        Command::CleanupIdempotency => cleanup_idempotency().await,
        Command::LoadTest {
            org,
            count,
            concurrency,
            priority,
        } => load_test(org, count, concurrency, priority).await,
        Command::PeekResponses { agent_id } => peek_responses(agent_id).await,
        Command::SeedAudit { org_id, message_id } => seed_audit(org_id, message_id).await,
    }
}

async fn init_topology(orgs: Vec<String>, agents: Vec<String>) -> Result<(), QueueError> {
    let broker_config = BrokerConfig::from_env().map_err(config_err)?;
    let retry = config::retry_from_env().map_err(config_err)?;

    let connection = broker::connect(&broker_config.url).await?;
    let channel = broker::open_channel(&connection).await?;

    for org in &orgs {
        topology::declare_org_topology(&channel, org).await?;
        topology::declare_org_retry_topology(&channel, org, &retry.delays_ms).await?;
        topology::declare_org_dlq_topology(&channel, org).await?;
        tracing::info!(org_id = %org, "topology declared");
    }
    for agent in &agents {
        topology::declare_agent_response_topology(&channel, agent).await?;
        tracing::info!(agent_id = %agent, "response topology declared");
    }
    Ok(())
}

async fn consume(org: String, concurrency: Option<u16>) -> Result<(), QueueError> {
    let mut config = QueueConfig::from_env().map_err(config_err)?;
    if let Some(concurrency) = concurrency {
        if concurrency == 0 {
            return Err(QueueError::Configuration {
                message: "--concurrency must be greater than 0".to_string(),
            });
        }
        config.rate_limit.org_max_in_flight = concurrency;
    }
    metrics::register_metrics();

    let pool = db::init_pool(&config.database.url, config.database.pool_size)?;
    let batcher = AuditBatcher::spawn(
        Arc::new(PostgresAuditWriter::new(pool.clone())),
        config.audit.clone(),
    );

    let connection = broker::connect(&config.broker.url).await?;
    let streamer = Arc::new(ResponseStreamer::new(&connection).await?);
    let idempotency = Arc::new(PostgresIdempotencyStore::new(pool.clone()));
    let poison = Arc::new(PostgresPoisonStore::new(pool.clone(), config.poison_threshold));

    let mut registry = HandlerRegistry::new();
    registry.register("agent_message", Arc::new(EchoHandler));
    let registry = Arc::new(registry);

    let shutdown = CancellationToken::new();
    let harness = ConsumerHarness::new(
        &connection,
        org.as_str(),
        &config,
        registry,
        idempotency,
        poison,
        batcher.handle(),
        streamer,
        shutdown.clone(),
    )
    .await?;

    let worker = tokio::spawn(async move { harness.run().await });

    tokio::signal::ctrl_c().await.map_err(|e| QueueError::Configuration {
        message: format!("failed to install signal handler: {}", e),
    })?;
    tracing::info!("shutdown requested, draining in-flight work");
    shutdown.cancel();

    let grace = Duration::from_millis(config.consumer.shutdown_grace_ms);
    match tokio::time::timeout(grace, worker).await {
        Ok(Ok(result)) => result?,
        Ok(Err(join_err)) => tracing::error!("worker task failed: {}", join_err),
        Err(_) => tracing::warn!("grace period elapsed before the worker drained"),
    }

    batcher.shutdown().await;
    Ok(())
}

async fn cleanup_dlq(org_id: Option<String>) -> Result<(), QueueError> {
    let database = DatabaseConfig::from_env().map_err(config_err)?;
    let retention_config = RetentionConfig::from_env().map_err(config_err)?;
    let pool = db::init_pool(&database.url, database.pool_size)?;

    let cutoff = retention::dlq_cutoff(&retention_config);
    let deleted = retention::purge_dlq(&pool, org_id.as_deref(), cutoff).await?;
    println!(
        "Deleted {} DLQ messages older than {}{}",
        deleted,
        cutoff.to_rfc3339(),
        org_id.map(|o| format!(" for org={}", o)).unwrap_or_default()
    );
    Ok(())
}

async fn cleanup_idempotency() -> Result<(), QueueError> {
    let database = DatabaseConfig::from_env().map_err(config_err)?;
    let retention_config = RetentionConfig::from_env().map_err(config_err)?;
    let pool = db::init_pool(&database.url, database.pool_size)?;

    let cutoff = retention::idempotency_cutoff(&retention_config);
    let deleted = retention::purge_idempotency(&pool, cutoff).await?;
    println!(
        "Deleted {} idempotency keys older than {}",
        deleted,
        cutoff.to_rfc3339()
    );
    Ok(())
}

fn load_test_envelope(org_id: &str, priority: u8) -> Result<MessageEnvelope, QueueError> {
    MessageEnvelope::validate(&json!({
        "message_id": Uuid::new_v4().to_string(),
        "version": "1.0.0",
        "org_id": org_id,
        "type": "agent_message",
        "priority": priority,
        "created_by": {"type": "system", "id": "load-test"},
        "created_at": Utc::now().to_rfc3339(),
    }))
}

async fn load_test(
    org: String,
    count: usize,
    concurrency: usize,
    priority: u8,
) -> Result<(), QueueError> {
    let broker_config = BrokerConfig::from_env().map_err(config_err)?;
    let rate_limit = RateLimitConfig::from_env().map_err(config_err)?;
    let retry = config::retry_from_env().map_err(config_err)?;

    let connection = broker::connect(&broker_config.url).await?;
    let publisher = Arc::new(RequestPublisher::new(&connection, &rate_limit).await?);
    topology::declare_org_topology(publisher.channel(), &org).await?;
    topology::declare_org_retry_topology(publisher.channel(), &org, &retry.delays_ms).await?;
    topology::declare_org_dlq_topology(publisher.channel(), &org).await?;

    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));
    let started = Instant::now();
    let mut tasks = Vec::with_capacity(count);

    for _ in 0..count {
        let publisher = Arc::clone(&publisher);
        let semaphore = Arc::clone(&semaphore);
        let org = org.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            let envelope = load_test_envelope(&org, priority).ok()?;
            let publish_started = Instant::now();
            match publisher.publish_request(&org, &envelope).await {
                Ok(()) => Some(publish_started.elapsed()),
                Err(e) => {
                    tracing::warn!("publish failed: {}", e);
                    None
                }
            }
        }));
    }

    let mut latencies = Vec::with_capacity(count);
    for task in tasks {
        if let Ok(Some(latency)) = task.await {
            latencies.push(latency);
        }
    }

    let total = started.elapsed().as_secs_f64();
    println!(
        "published={} concurrency={} total_sec={:.2} tps={:.1}",
        latencies.len(),
        concurrency,
        total,
        latencies.len() as f64 / total.max(f64::EPSILON)
    );
    if !latencies.is_empty() {
        let mean_ms = latencies.iter().map(Duration::as_secs_f64).sum::<f64>()
            / latencies.len() as f64
            * 1000.0;
        println!("publish_latency_ms: mean~{:.2}", mean_ms);
    }
    Ok(())
}

async fn peek_responses(agent_id: String) -> Result<(), QueueError> {
    let broker_config = BrokerConfig::from_env().map_err(config_err)?;
    let connection = broker::connect(&broker_config.url).await?;
    let channel = broker::open_channel(&connection).await?;
    topology::declare_agent_response_topology(&channel, &agent_id).await?;

    let message = channel
        .basic_get(
            &topology::response_queue(&agent_id),
            BasicGetOptions { no_ack: true },
        )
        .await
        .map_err(|e| QueueError::Broker {
            message: format!("Failed to get from response queue: {}", e),
        })?;

    match message {
        Some(message) => {
            let payload: serde_json::Value = serde_json::from_slice(&message.delivery.data)
                .unwrap_or_else(|_| json!({"malformed": true}));
            println!("{}", payload);
        }
        None => println!("{}", json!({"empty": true})),
    }
    Ok(())
}

async fn seed_audit(org_id: String, message_id: Option<Uuid>) -> Result<(), QueueError> {
    let database = DatabaseConfig::from_env().map_err(config_err)?;
    let pool = db::init_pool(&database.url, database.pool_size)?;
    let writer = PostgresAuditWriter::new(pool);

    let message_id = message_id.unwrap_or_else(Uuid::new_v4);
    let envelope = MessageEnvelope::validate(&json!({
        "message_id": message_id.to_string(),
        "version": "1.0.0",
        "org_id": org_id,
        "type": "agent_message",
        "priority": 2,
        "created_by": {"type": "system", "id": "seed"},
        "created_at": Utc::now().to_rfc3339(),
        "goal_id": Uuid::new_v4().to_string(),
        "task_id": Uuid::new_v4().to_string(),
        "context": {"seed": true},
        "metadata": {},
    }))?;

    let batch = AuditBatch {
        states: vec![MessageRecord::from_envelope(&envelope, MessageStatus::Queued)],
        events: vec![
            MessageEventRecord::new(Some(message_id), &envelope.org_id, events::CREATED, None),
            MessageEventRecord::new(Some(message_id), &envelope.org_id, events::ENQUEUED, None),
        ],
        dlq: vec![],
    };
    writer.write_batch(&batch).await?;

    println!(
        "{}",
        json!({"message_id": message_id.to_string(), "org_id": envelope.org_id})
    );
    Ok(())
}
