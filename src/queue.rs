use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use crate::error::{LogError, RelayError};
use crate::storage::{DurableLog, Fields};
use crate::types::{DlqEntry, LogEntryId, RelayMessage, StreamEntry};

const DATA_FIELD: &str = "data";
const ORIGINAL_ID_FIELD: &str = "original_id";
const MOVED_AT_FIELD: &str = "moved_at";

/// Stream, group and consumer names shared by both relay processes.
#[derive(Debug, Clone)]
pub struct QueueNames {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub dead_letter: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            stream: "webhook-stream".to_string(),
            group: "relay-group".to_string(),
            consumer: "relay-client".to_string(),
            dead_letter: "webhook-dlq".to_string(),
        }
    }
}

/// A relay message read back from the main log.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry_id: LogEntryId,
    pub message: RelayMessage,
}

/// Typed access to the relay's streams.
///
/// Relay messages are stored as `{data: <json>}`. Dead-letter entries add
/// the original entry id and the move time in unix seconds.
#[derive(Clone)]
pub struct RelayQueue {
    log: Arc<dyn DurableLog>,
    names: QueueNames,
}

impl RelayQueue {
    pub fn new(log: Arc<dyn DurableLog>, names: QueueNames) -> Self {
        Self { log, names }
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub async fn enqueue(&self, message: &RelayMessage) -> Result<LogEntryId, RelayError> {
        let data = serde_json::to_string(message).map_err(LogError::from)?;
        let id = self
            .log
            .append(&self.names.stream, vec![(DATA_FIELD.to_string(), data)])
            .await?;
        Ok(id)
    }

    pub async fn ensure_group(&self) -> Result<(), RelayError> {
        self.log
            .ensure_consumer_group(&self.names.stream, &self.names.group)
            .await?;
        Ok(())
    }

    /// Claim new entries for this consumer. Entries that fail to decode are
    /// returned as errors alongside their id so the caller can settle them.
    pub async fn read_batch(
        &self,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Result<Delivery, LogError>>, RelayError> {
        let entries = self
            .log
            .read_group(
                &self.names.stream,
                &self.names.group,
                &self.names.consumer,
                max_count,
                block,
            )
            .await?;
        Ok(entries.into_iter().map(parse_entry).collect())
    }

    /// Entries this consumer claimed earlier and never acknowledged, in
    /// pages that start after `after`.
    pub async fn read_pending(
        &self,
        after: Option<&LogEntryId>,
        max_count: usize,
    ) -> Result<Vec<Result<Delivery, LogError>>, RelayError> {
        let entries = self
            .log
            .read_pending(
                &self.names.stream,
                &self.names.group,
                &self.names.consumer,
                after,
                max_count,
            )
            .await?;
        Ok(entries.into_iter().map(parse_entry).collect())
    }

    /// Acknowledge an entry and drop its stored retry count.
    pub async fn ack(&self, id: &LogEntryId) -> Result<u64, RelayError> {
        let acked = self.log.ack(&self.names.stream, &self.names.group, id).await?;
        self.forget_retries(id).await;
        Ok(acked)
    }

    /// Durably record how many retries an entry has used.
    pub async fn record_retry(&self, id: &LogEntryId, retry_count: u32) -> Result<(), RelayError> {
        self.log
            .store_retry_count(&self.retry_key(), id, retry_count)
            .await?;
        Ok(())
    }

    /// Retry count persisted for a pending entry, if any retry was recorded.
    pub async fn recorded_retries(&self, id: &LogEntryId) -> Result<Option<u32>, RelayError> {
        Ok(self.log.retry_count(&self.retry_key(), id).await?)
    }

    fn retry_key(&self) -> String {
        format!("{}:{}:retries", self.names.stream, self.names.group)
    }

    async fn forget_retries(&self, id: &LogEntryId) {
        // A stale count on a settled entry is never read again.
        if let Err(err) = self.log.clear_retry_count(&self.retry_key(), id).await {
            tracing::warn!(entry_id = %id, error = %err, "could not clear retry count");
        }
    }

    /// Move a message to the dead-letter stream and acknowledge the original.
    pub async fn dead_letter(
        &self,
        original_id: &LogEntryId,
        message: &RelayMessage,
    ) -> Result<LogEntryId, RelayError> {
        let fields: Fields = vec![
            (ORIGINAL_ID_FIELD.to_string(), original_id.0.clone()),
            (
                DATA_FIELD.to_string(),
                serde_json::to_string(message).map_err(LogError::from)?,
            ),
            (MOVED_AT_FIELD.to_string(), Utc::now().timestamp().to_string()),
        ];
        let id = self
            .log
            .append_and_ack(
                &self.names.dead_letter,
                fields,
                &self.names.stream,
                &self.names.group,
                original_id,
            )
            .await?;
        self.forget_retries(original_id).await;
        Ok(id)
    }

    /// Oldest-first dead-letter entries. Undecodable entries are skipped.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DlqEntry>, RelayError> {
        let entries = self.log.range(&self.names.dead_letter, limit).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match parse_dlq_entry(entry) {
                Ok(dlq) => Some(dlq),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    pub async fn find_dead_letter(&self, id: &LogEntryId) -> Result<DlqEntry, RelayError> {
        let entry = self
            .log
            .get(&self.names.dead_letter, id)
            .await?
            .ok_or_else(|| RelayError::DeadLetterNotFound(id.clone()))?;
        Ok(parse_dlq_entry(entry)?)
    }

    /// Re-enqueue a dead-lettered message with a fresh retry budget, then
    /// drop the dead-letter entry. Returns the new main-log id.
    pub async fn replay_dead_letter(&self, id: &LogEntryId) -> Result<LogEntryId, RelayError> {
        let dlq = self.find_dead_letter(id).await?;
        let new_id = self.enqueue(&dlq.message.replayed()).await?;
        self.log.delete(&self.names.dead_letter, id).await?;
        tracing::info!(
            dlq_id = %id,
            new_id = %new_id,
            webhook_id = %dlq.message.envelope.id(),
            "replayed dead-letter entry"
        );
        Ok(new_id)
    }

    pub async fn delete_dead_letter(&self, id: &LogEntryId) -> Result<(), RelayError> {
        if self.log.delete(&self.names.dead_letter, id).await? {
            Ok(())
        } else {
            Err(RelayError::DeadLetterNotFound(id.clone()))
        }
    }

    pub async fn queue_depth(&self) -> Result<u64, RelayError> {
        Ok(self.log.length(&self.names.stream).await?)
    }

    pub async fn pending(&self) -> Result<u64, RelayError> {
        Ok(self
            .log
            .pending_count(&self.names.stream, &self.names.group)
            .await?)
    }

    pub async fn dead_letter_depth(&self) -> Result<u64, RelayError> {
        Ok(self.log.length(&self.names.dead_letter).await?)
    }
}

/// Decode a main-log entry into a relay message.
pub fn parse_entry(entry: StreamEntry) -> Result<Delivery, LogError> {
    let data = entry.field(DATA_FIELD).ok_or_else(|| LogError::MalformedEntry {
        id: entry.id.clone(),
        reason: "missing data field".to_string(),
    })?;
    let message = serde_json::from_str(data).map_err(|e| LogError::MalformedEntry {
        id: entry.id.clone(),
        reason: e.to_string(),
    })?;
    Ok(Delivery {
        entry_id: entry.id,
        message,
    })
}

fn parse_dlq_entry(entry: StreamEntry) -> Result<DlqEntry, LogError> {
    let malformed = |reason: &str| LogError::MalformedEntry {
        id: entry.id.clone(),
        reason: reason.to_string(),
    };
    let original_id = entry
        .field(ORIGINAL_ID_FIELD)
        .ok_or_else(|| malformed("missing original_id field"))?;
    let data = entry.field(DATA_FIELD).ok_or_else(|| malformed("missing data field"))?;
    let moved_at = entry
        .field(MOVED_AT_FIELD)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| malformed("missing or invalid moved_at field"))?;
    let message = serde_json::from_str(data).map_err(|e| malformed(&e.to_string()))?;

    Ok(DlqEntry {
        dlq_id: entry.id.clone(),
        original_id: LogEntryId::from(original_id),
        message,
        moved_at,
    })
}
