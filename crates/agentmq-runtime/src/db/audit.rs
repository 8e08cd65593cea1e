//! Asynchronous audit batcher.
//!
//! Producers enqueue lifecycle records into a bounded in-memory queue; a
//! single background task drains it and writes one batch insert per
//! destination table. Flush triggers: batch size, oldest-item age,
//! explicit flush, and shutdown. Audit loss must never stall the data
//! plane: writes retry with capped exponential backoff and are dropped
//! (with a metric) on exhaustion, and a full queue drops its oldest batch
//! rather than blocking the producer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::upsert::excluded;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentmq_core::config::AuditConfig;
use agentmq_core::envelope::MessageEnvelope;
use agentmq_core::error::QueueError;
use agentmq_core::lifecycle::MessageStatus;

use super::models::{DlqMessageRecord, MessageEventRecord, MessageRecord};
use super::schema::{dlq_messages, message_events, messages};
use super::{get_connection, DbPool};
use crate::metrics;

const WRITE_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_millis(2000);

/// One enqueued audit record, routed to its destination table at flush.
#[derive(Debug, Clone)]
pub enum AuditRecord {
    State(MessageRecord),
    Event(MessageEventRecord),
    Dlq(DlqMessageRecord),
}

/// Records drained for one flush, grouped by destination table in
/// enqueue order.
#[derive(Debug, Default)]
pub struct AuditBatch {
    pub states: Vec<MessageRecord>,
    pub events: Vec<MessageEventRecord>,
    pub dlq: Vec<DlqMessageRecord>,
}

impl AuditBatch {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty() && self.events.is_empty() && self.dlq.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len() + self.events.len() + self.dlq.len()
    }

    fn push(&mut self, record: AuditRecord) {
        match record {
            // A later state snapshot for the same message supersedes an
            // earlier one within the batch; the upsert requires distinct
            // keys per statement.
            AuditRecord::State(state) => {
                self.states.retain(|s| s.message_id != state.message_id);
                self.states.push(state);
            }
            AuditRecord::Event(event) => self.events.push(event),
            AuditRecord::Dlq(dlq) => self.dlq.push(dlq),
        }
    }
}

/// Durable sink for drained batches.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write_batch(&self, batch: &AuditBatch) -> Result<(), QueueError>;
}

/// PostgreSQL writer: one batch insert per destination table.
pub struct PostgresAuditWriter {
    pool: DbPool,
}

impl PostgresAuditWriter {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditWriter for PostgresAuditWriter {
    async fn write_batch(&self, batch: &AuditBatch) -> Result<(), QueueError> {
        let mut conn = get_connection(&self.pool)?;

        if !batch.states.is_empty() {
            diesel::insert_into(messages::table)
                .values(&batch.states)
                .on_conflict(messages::message_id)
                .do_update()
                .set((
                    messages::agent_id.eq(excluded(messages::agent_id)),
                    messages::message_type.eq(excluded(messages::message_type)),
                    messages::priority.eq(excluded(messages::priority)),
                    messages::status.eq(excluded(messages::status)),
                    messages::payload.eq(excluded(messages::payload)),
                    messages::updated_at.eq(excluded(messages::updated_at)),
                ))
                .execute(&mut conn)
                .map_err(|e| QueueError::AuditBackend {
                    message: format!("Failed to upsert message states: {}", e),
                })?;
        }

        if !batch.events.is_empty() {
            diesel::insert_into(message_events::table)
                .values(&batch.events)
                .execute(&mut conn)
                .map_err(|e| QueueError::AuditBackend {
                    message: format!("Failed to insert message events: {}", e),
                })?;
        }

        if !batch.dlq.is_empty() {
            diesel::insert_into(dlq_messages::table)
                .values(&batch.dlq)
                .execute(&mut conn)
                .map_err(|e| QueueError::AuditBackend {
                    message: format!("Failed to insert DLQ rows: {}", e),
                })?;
        }

        Ok(())
    }
}

struct BatcherShared {
    queue: StdMutex<VecDeque<(Instant, AuditRecord)>>,
    notify: Notify,
    queue_max: usize,
    batch_size: usize,
}

/// Cloneable producer handle onto the audit queue.
#[derive(Clone)]
pub struct AuditHandle {
    shared: Arc<BatcherShared>,
}

impl AuditHandle {
    /// Enqueue a record; never blocks. When the queue is full the oldest
    /// batch is dropped and counted.
    pub fn enqueue(&self, record: AuditRecord) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= self.shared.queue_max {
                let drop_count = self.shared.batch_size.min(queue.len());
                queue.drain(..drop_count);
                metrics::AUDIT_EVENTS_DROPPED_TOTAL.inc_by(drop_count as u64);
                tracing::warn!(dropped = drop_count, "audit queue full; dropped oldest batch");
            }
            queue.push_back((Instant::now(), record));
        }
        self.shared.notify.notify_one();
    }

    /// Append-only lifecycle event.
    pub fn event(
        &self,
        message_id: Option<Uuid>,
        org_id: &str,
        event_type: &str,
        details: Option<Value>,
    ) {
        self.enqueue(AuditRecord::Event(MessageEventRecord::new(
            message_id, org_id, event_type, details,
        )));
    }

    /// Latest-state snapshot for the message.
    pub fn state(&self, envelope: &MessageEnvelope, status: MessageStatus) {
        self.enqueue(AuditRecord::State(MessageRecord::from_envelope(
            envelope, status,
        )));
    }

    /// Terminal DLQ row.
    pub fn dlq(&self, org_id: &str, original_message: Value, error: Value, can_replay: bool) {
        self.enqueue(AuditRecord::Dlq(DlqMessageRecord::new(
            org_id,
            original_message,
            error,
            can_replay,
        )));
    }
}

/// Bounded audit queue with a single background drain task.
pub struct AuditBatcher {
    shared: Arc<BatcherShared>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl AuditBatcher {
    /// Start the drain task; must be called from within a tokio runtime.
    pub fn spawn(writer: Arc<dyn AuditWriter>, config: AuditConfig) -> Self {
        let shared = Arc::new(BatcherShared {
            queue: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            queue_max: config.queue_max,
            batch_size: config.batch_size,
        });
        let (flush_tx, flush_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(drain_loop(
            Arc::clone(&shared),
            writer,
            config,
            flush_rx,
            shutdown.clone(),
        ));
        Self {
            shared,
            flush_tx,
            shutdown,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> AuditHandle {
        AuditHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drain and write everything currently queued.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Graceful shutdown: flush remaining records, then stop the task.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.shared.notify.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("audit drain task panicked: {}", e);
            }
        }
    }
}

fn drain_batch(shared: &BatcherShared) -> AuditBatch {
    let mut batch = AuditBatch::default();
    let mut queue = shared.queue.lock().unwrap();
    let take = shared.batch_size.min(queue.len());
    for (_, record) in queue.drain(..take) {
        batch.push(record);
    }
    batch
}

async fn write_with_backoff(writer: &dyn AuditWriter, batch: &AuditBatch) {
    let mut delay = BACKOFF_BASE;
    for attempt in 1..=WRITE_ATTEMPTS {
        match writer.write_batch(batch).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(attempt, "audit batch write failed: {}", e);
                if attempt < WRITE_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
        }
    }
    metrics::AUDIT_WRITE_FAILED_TOTAL.inc();
    metrics::AUDIT_EVENTS_DROPPED_TOTAL.inc_by(batch.len() as u64);
    tracing::error!(
        dropped = batch.len(),
        "dropping audit batch after {} failed attempts",
        WRITE_ATTEMPTS
    );
}

async fn drain_loop(
    shared: Arc<BatcherShared>,
    writer: Arc<dyn AuditWriter>,
    config: AuditConfig,
    mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    shutdown: CancellationToken,
) {
    let flush_interval = Duration::from_millis(config.flush_interval_ms);
    let mut flush_closed = false;

    loop {
        let (len, oldest_age) = {
            let queue = shared.queue.lock().unwrap();
            let now = Instant::now();
            (
                queue.len(),
                queue.front().map(|(enqueued, _)| now.duration_since(*enqueued)),
            )
        };

        let size_due = len >= config.batch_size;
        let age_due = oldest_age.map_or(false, |age| age >= flush_interval);
        if size_due || age_due {
            let batch = drain_batch(&shared);
            if !batch.is_empty() {
                write_with_backoff(writer.as_ref(), &batch).await;
            }
            continue;
        }

        let age_deadline = oldest_age.map(|age| flush_interval.saturating_sub(age));
        tokio::select! {
            _ = shutdown.cancelled() => break,
            request = flush_rx.recv(), if !flush_closed => {
                match request {
                    Some(ack) => {
                        loop {
                            let batch = drain_batch(&shared);
                            if batch.is_empty() {
                                break;
                            }
                            write_with_backoff(writer.as_ref(), &batch).await;
                        }
                        let _ = ack.send(());
                    }
                    None => flush_closed = true,
                }
            }
            _ = shared.notify.notified() => {}
            _ = sleep_until_due(age_deadline) => {}
        }
    }

    // Shutdown flush: nothing enqueued after this point is written.
    loop {
        let batch = drain_batch(&shared);
        if batch.is_empty() {
            break;
        }
        write_with_backoff(writer.as_ref(), &batch).await;
    }
    tracing::info!("audit batcher stopped");
}

async fn sleep_until_due(deadline: Option<Duration>) {
    match deadline {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct RecordingWriter {
        batches: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl RecordingWriter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl AuditWriter for RecordingWriter {
        async fn write_batch(&self, batch: &AuditBatch) -> Result<(), QueueError> {
            if self.fail {
                return Err(QueueError::AuditBackend {
                    message: "backend down".to_string(),
                });
            }
            self.batches.lock().await.push(batch.len());
            Ok(())
        }
    }

    fn config(batch_size: usize, flush_interval_ms: u64, queue_max: usize) -> AuditConfig {
        AuditConfig {
            batch_size,
            flush_interval_ms,
            queue_max,
        }
    }

    fn sample_event(i: usize) -> AuditRecord {
        AuditRecord::Event(MessageEventRecord::new(
            None,
            "o",
            "created",
            Some(serde_json::json!({ "i": i })),
        ))
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let writer = RecordingWriter::new(false);
        let batcher = AuditBatcher::spawn(writer.clone(), config(5, 10_000, 100));
        let handle = batcher.handle();

        for i in 0..5 {
            handle.enqueue(sample_event(i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let batches = writer.batches.lock().await;
        assert_eq!(batches.as_slice(), &[5]);
        drop(batches);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let writer = RecordingWriter::new(false);
        let batcher = AuditBatcher::spawn(writer.clone(), config(10, 50, 100));
        let handle = batcher.handle();

        for i in 0..3 {
            handle.enqueue(sample_event(i));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = writer.batches.lock().await;
        assert!(!batches.is_empty());
        assert_eq!(batches.iter().sum::<usize>(), 3);
        drop(batches);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let writer = RecordingWriter::new(false);
        let batcher = AuditBatcher::spawn(writer.clone(), config(100, 60_000, 1000));
        let handle = batcher.handle();

        for i in 0..7 {
            handle.enqueue(sample_event(i));
        }
        batcher.flush().await;

        assert_eq!(writer.batches.lock().await.iter().sum::<usize>(), 7);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let writer = RecordingWriter::new(false);
        let batcher = AuditBatcher::spawn(writer.clone(), config(100, 60_000, 1000));
        let handle = batcher.handle();

        for i in 0..4 {
            handle.enqueue(sample_event(i));
        }
        batcher.shutdown().await;

        assert_eq!(writer.batches.lock().await.iter().sum::<usize>(), 4);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_batch() {
        let writer = RecordingWriter::new(false);
        // Tiny queue with a long interval so nothing drains on its own.
        let batcher = AuditBatcher::spawn(writer.clone(), config(2, 60_000, 2));
        let handle = batcher.handle();

        // Third enqueue overflows the queue and evicts the oldest two.
        handle.enqueue(sample_event(0));
        handle.enqueue(sample_event(1));
        handle.enqueue(sample_event(2));
        batcher.flush().await;

        assert_eq!(writer.batches.lock().await.iter().sum::<usize>(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_drops_after_retries() {
        let writer = RecordingWriter::new(true);
        let before = metrics::AUDIT_WRITE_FAILED_TOTAL.get();
        let batcher = AuditBatcher::spawn(writer.clone(), config(1, 60_000, 10));
        let handle = batcher.handle();

        handle.enqueue(sample_event(0));
        // Paused clock auto-advances through the backoff sleeps.
        batcher.flush().await;
        batcher.shutdown().await;

        assert!(metrics::AUDIT_WRITE_FAILED_TOTAL.get() > before);
    }

    #[tokio::test]
    async fn test_state_dedupe_keeps_last() {
        use agentmq_core::lifecycle::MessageStatus;
        use serde_json::json;

        let envelope = MessageEnvelope::validate(&json!({
            "message_id": "5a4d3c2b-1e0f-4a9b-8c7d-6e5f4a3b2c1d",
            "version": "1.0.0",
            "org_id": "o",
            "type": "agent_message",
            "created_by": {"type": "system", "id": "t"},
            "created_at": "2025-01-01T00:00:00Z",
        }))
        .unwrap();

        let mut batch = AuditBatch::default();
        batch.push(AuditRecord::State(MessageRecord::from_envelope(
            &envelope,
            MessageStatus::Processing,
        )));
        batch.push(AuditRecord::State(MessageRecord::from_envelope(
            &envelope,
            MessageStatus::Completed,
        )));

        assert_eq!(batch.states.len(), 1);
        assert_eq!(batch.states[0].status, "COMPLETED");
    }
}
