use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LogError, RelayError};
use crate::forwarder::Forwarder;
use crate::metrics::MetricsSink;
use crate::queue::{Delivery, RelayQueue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::types::LogEntryId;

/// Page size used when reclaiming the pending set at startup.
const RECLAIM_PAGE: usize = 500;

/// Longest wait the delay queue will schedule.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub read_error_backoff: Duration,
    /// Target used when a message carries no route-specific endpoint.
    pub default_target: String,
    pub retry_policy: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_timeout: Duration::from_millis(5_000),
            read_error_backoff: Duration::from_millis(5_000),
            default_target: "http://localhost:3000/webhook".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Reads relay messages from the log and forwards them one at a time.
///
/// Failed messages are not re-appended. They stay pending in the log and
/// wait in an in-process delay queue until their backoff elapses, so new
/// entries keep flowing while a retry is outstanding. Each retry count is
/// also written to the log, so after a restart the consumer reclaims what it
/// left pending and resumes every message with the budget it had used.
pub struct DeliveryConsumer {
    queue: RelayQueue,
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<dyn MetricsSink>,
    config: ConsumerConfig,
}

#[derive(Debug)]
enum Task {
    Forward(Delivery),
    /// Acknowledge an entry whose outcome is already settled.
    Ack {
        entry_id: LogEntryId,
        /// Forward latency when the entry was delivered.
        delivered: Option<Duration>,
    },
}

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    seq: u64,
    task: Task,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for min-heap behavior; earlier insertion wins ties.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct DelayQueue {
    heap: BinaryHeap<TimedTask>,
    next_seq: u64,
}

impl DelayQueue {
    fn schedule(&mut self, task: Task, delay: Duration) {
        let ready_at = Instant::now() + delay.min(MAX_RETRY_DELAY);
        self.next_seq += 1;
        self.heap.push(TimedTask {
            ready_at,
            seq: self.next_seq,
            task,
        });
    }

    fn pop_due(&mut self, now: Instant) -> Option<Task> {
        if self.heap.peek()?.ready_at > now {
            return None;
        }
        self.heap.pop().map(|t| t.task)
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|t| t.ready_at)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

impl DeliveryConsumer {
    pub fn new(
        queue: RelayQueue,
        forwarder: Arc<dyn Forwarder>,
        metrics: Arc<dyn MetricsSink>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            forwarder,
            metrics,
            config,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The blocking read and the read-error backoff return as soon as
    /// cancellation is requested. A forward already in flight runs to
    /// completion, bounded by the forwarder's timeout.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        if !self.ensure_group(&shutdown).await {
            return Ok(());
        }

        let mut delayed = DelayQueue::default();
        self.reclaim_pending(&mut delayed).await;

        tracing::info!(
            stream = %self.queue.names().stream,
            group = %self.queue.names().group,
            consumer = %self.queue.names().consumer,
            "delivery consumer started"
        );

        'outer: while !shutdown.is_cancelled() {
            while let Some(task) = delayed.pop_due(Instant::now()) {
                match task {
                    Task::Forward(delivery) => self.process(delivery, &mut delayed).await,
                    Task::Ack { entry_id, delivered } => self.settle(entry_id, delivered, &mut delayed).await,
                }
                if shutdown.is_cancelled() {
                    break 'outer;
                }
            }

            let block = match delayed.next_due() {
                Some(due) => due
                    .saturating_duration_since(Instant::now())
                    .min(self.config.block_timeout),
                None => self.config.block_timeout,
            };
            if block.is_zero() {
                continue;
            }

            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self.queue.read_batch(self.config.batch_size, block) => batch,
            };

            match batch {
                Ok(entries) => {
                    for entry in entries {
                        match entry {
                            Ok(delivery) => self.process(delivery, &mut delayed).await,
                            Err(err) => self.discard(err, &mut delayed).await,
                        }
                        if shutdown.is_cancelled() {
                            break 'outer;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        backoff_ms = self.config.read_error_backoff.as_millis() as u64,
                        "log read failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.read_error_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(scheduled_retries = delayed.len(), "delivery consumer stopped");
        Ok(())
    }

    async fn ensure_group(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.queue.ensure_group().await {
                Ok(()) => return true,
                Err(err) => {
                    tracing::error!(error = %err, "failed to ensure consumer group");
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.config.read_error_backoff) => {}
                    }
                }
            }
        }
    }

    /// Schedule everything this consumer left pending, restoring the retry
    /// count each entry had reached.
    async fn reclaim_pending(&self, delayed: &mut DelayQueue) {
        let mut after: Option<LogEntryId> = None;
        let mut reclaimed = 0usize;
        loop {
            let page = match self.queue.read_pending(after.as_ref(), RECLAIM_PAGE).await {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(error = %err, reclaimed, "could not read pending entries");
                    return;
                }
            };
            let page_len = page.len();
            let cursor = after.clone();

            for entry in page {
                match entry {
                    Ok(mut delivery) => {
                        after = Some(delivery.entry_id.clone());
                        match self.queue.recorded_retries(&delivery.entry_id).await {
                            Ok(Some(count)) => {
                                delivery.message.retry_count = delivery.message.retry_count.max(count);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                tracing::warn!(
                                    entry_id = %delivery.entry_id,
                                    error = %err,
                                    "could not read retry count"
                                );
                            }
                        }
                        delayed.schedule(Task::Forward(delivery), Duration::ZERO);
                    }
                    Err(err) => {
                        if let LogError::MalformedEntry { id, .. } = &err {
                            after = Some(id.clone());
                        }
                        self.discard(err, delayed).await;
                    }
                }
            }

            reclaimed += page_len;
            if page_len < RECLAIM_PAGE || after == cursor {
                break;
            }
        }
        if reclaimed > 0 {
            tracing::info!(count = reclaimed, "reclaimed pending entries");
        }
    }

    async fn process(&self, delivery: Delivery, delayed: &mut DelayQueue) {
        let message = &delivery.message;
        let target = message
            .target_endpoint
            .as_deref()
            .unwrap_or(&self.config.default_target);

        let failure = match self.forwarder.forward(&message.envelope, target).await {
            Ok(receipt) => {
                tracing::debug!(
                    entry_id = %delivery.entry_id,
                    webhook_id = %message.envelope.id(),
                    status = receipt.status,
                    latency_ms = receipt.latency.as_millis() as u64,
                    "webhook delivered"
                );
                self.settle(delivery.entry_id, Some(receipt.latency), delayed).await;
                return;
            }
            Err(reason) => RelayError::ForwardFailed(reason),
        };

        let policy = message.retry_policy.as_ref().unwrap_or(&self.config.retry_policy);
        match policy.decide(message.retry_count) {
            RetryDecision::Retry(delay) => {
                let mut delivery = delivery;
                delivery.message.retry_count += 1;
                if let Err(err) = self
                    .queue
                    .record_retry(&delivery.entry_id, delivery.message.retry_count)
                    .await
                {
                    // The in-memory count still applies until a restart.
                    tracing::error!(entry_id = %delivery.entry_id, error = %err, "could not persist retry count");
                }
                self.metrics.record_retried();
                tracing::warn!(
                    entry_id = %delivery.entry_id,
                    webhook_id = %delivery.message.envelope.id(),
                    retry_count = delivery.message.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "forward failed, retry scheduled"
                );
                delayed.schedule(Task::Forward(delivery), delay);
            }
            RetryDecision::Escalate => {
                let exhausted = RelayError::MaxRetriesExceeded {
                    retry_count: message.retry_count,
                };
                match self.queue.dead_letter(&delivery.entry_id, message).await {
                    Ok(dlq_id) => {
                        self.metrics.record_failed();
                        tracing::error!(
                            entry_id = %delivery.entry_id,
                            dlq_id = %dlq_id,
                            webhook_id = %message.envelope.id(),
                            error = %failure,
                            code = exhausted.code(),
                            "{}", exhausted
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            entry_id = %delivery.entry_id,
                            error = %err,
                            "dead-letter write failed"
                        );
                        delayed.schedule(Task::Forward(delivery), self.config.read_error_backoff);
                    }
                }
            }
        }
    }

    /// Acknowledge a settled entry. A failed ack is retried after the
    /// read-error backoff without forwarding again.
    async fn settle(&self, entry_id: LogEntryId, delivered: Option<Duration>, delayed: &mut DelayQueue) {
        match self.queue.ack(&entry_id).await {
            Ok(_) => {
                if let Some(latency) = delivered {
                    self.metrics.record_processed(latency);
                }
            }
            Err(err) => {
                tracing::error!(
                    entry_id = %entry_id,
                    error = %err,
                    backoff_ms = self.config.read_error_backoff.as_millis() as u64,
                    "ack failed, retry scheduled"
                );
                delayed.schedule(Task::Ack { entry_id, delivered }, self.config.read_error_backoff);
            }
        }
    }

    /// Settle an entry that cannot be decoded so it does not block the group.
    async fn discard(&self, err: LogError, delayed: &mut DelayQueue) {
        let (id, reason) = match err {
            LogError::MalformedEntry { id, reason } => (id, reason),
            other => {
                tracing::error!(error = %other, "unreadable log entry");
                return;
            }
        };
        tracing::error!(entry_id = %id, reason = %reason, "discarding malformed log entry");
        self.metrics.record_failed();
        self.settle(id, None, delayed).await;
    }
}
