use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::LogError;
use crate::types::{LogEntryId, StreamEntry};

/// Field/value pairs making up one log record.
pub type Fields = Vec<(String, String)>;

/// Append-only log with consumer-group semantics.
///
/// This is the contract the relay needs from its persistence substrate.
/// Implementations must be safe to share between the ingestion path and the
/// delivery consumer.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Durably append a record and return its ordered id.
    async fn append(&self, stream: &str, fields: Fields) -> Result<LogEntryId, LogError>;

    /// Create the consumer group (and the stream) if missing.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), LogError>;

    /// Claim entries never delivered to the group.
    ///
    /// Returns as soon as something is available, otherwise waits up to
    /// `block` and may return an empty batch.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Entries already claimed by `consumer` but never acknowledged, oldest
    /// first, starting strictly after `after` when given.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: Option<&LogEntryId>,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Acknowledge an entry. Returns how many entries left the pending set;
    /// acknowledging twice is not an error.
    async fn ack(&self, stream: &str, group: &str, id: &LogEntryId) -> Result<u64, LogError>;

    async fn length(&self, stream: &str) -> Result<u64, LogError>;

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, LogError>;

    /// Oldest-first entries of a stream, without any group bookkeeping.
    async fn range(&self, stream: &str, max_count: usize) -> Result<Vec<StreamEntry>, LogError>;

    /// Look up a single entry by id.
    async fn get(&self, stream: &str, id: &LogEntryId) -> Result<Option<StreamEntry>, LogError>;

    /// Remove an entry from a stream. Returns whether it existed.
    async fn delete(&self, stream: &str, id: &LogEntryId) -> Result<bool, LogError>;

    /// Persist the retry count reached by an entry under `key`.
    async fn store_retry_count(&self, key: &str, id: &LogEntryId, count: u32) -> Result<(), LogError>;

    async fn retry_count(&self, key: &str, id: &LogEntryId) -> Result<Option<u32>, LogError>;

    async fn clear_retry_count(&self, key: &str, id: &LogEntryId) -> Result<(), LogError>;

    /// Append to `target` and acknowledge `id` on `stream` as one transition.
    async fn append_and_ack(
        &self,
        target: &str,
        fields: Fields,
        stream: &str,
        group: &str,
        id: &LogEntryId,
    ) -> Result<LogEntryId, LogError> {
        let appended = self.append(target, fields).await?;
        self.ack(stream, group, id).await?;
        Ok(appended)
    }
}

/// In-memory log for tests and single-process deployments.
///
/// Mirrors the stream semantics the relay relies on: ids are ordered,
/// entries stay in the stream after acknowledgement, and a group tracks a
/// delivery cursor plus a pending set per consumer.
#[derive(Default)]
pub struct InMemoryLog {
    inner: Mutex<Streams>,
    appended: Notify,
}

#[derive(Default)]
struct Streams {
    next_seq: u64,
    streams: HashMap<String, Stream>,
    retry_counts: HashMap<String, HashMap<String, u32>>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<u64, StreamEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Highest sequence delivered to the group.
    delivered: u64,
    /// Pending sequences and the consumer that claimed them.
    pending: BTreeMap<u64, String>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_seq(id: &LogEntryId) -> Option<u64> {
        id.0.split('-').next()?.parse().ok()
    }

    fn claim_new(
        streams: &mut Streams,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let missing = || LogError::MissingGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.streams.get_mut(stream).ok_or_else(missing)?;
        let group_state = state.groups.get_mut(group).ok_or_else(missing)?;

        let claimed: Vec<(u64, StreamEntry)> = state
            .entries
            .range(group_state.delivered + 1..)
            .take(max_count.max(1))
            .map(|(seq, entry)| (*seq, entry.clone()))
            .collect();

        for (seq, _) in &claimed {
            group_state.delivered = *seq;
            group_state.pending.insert(*seq, consumer.to_string());
        }

        Ok(claimed.into_iter().map(|(_, entry)| entry).collect())
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    async fn append(&self, stream: &str, fields: Fields) -> Result<LogEntryId, LogError> {
        let id = {
            let mut guard = self.inner.lock().await;
            guard.next_seq += 1;
            let seq = guard.next_seq;
            let id = LogEntryId(format!("{}-0", seq));
            let entry = StreamEntry {
                id: id.clone(),
                fields: fields.into_iter().collect(),
            };
            guard.streams.entry(stream.to_string()).or_default().entries.insert(seq, entry);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let mut guard = self.inner.lock().await;
        guard
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.inner.lock().await;
                let claimed = Self::claim_new(&mut guard, stream, group, consumer, max_count)?;
                if !claimed.is_empty() {
                    return Ok(claimed);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: Option<&LogEntryId>,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let start = match after {
            Some(id) => Self::parse_seq(id).ok_or_else(|| LogError::MalformedEntry {
                id: id.clone(),
                reason: "not a log entry id".to_string(),
            })?,
            None => 0,
        };
        let guard = self.inner.lock().await;
        let Some(state) = guard.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(group_state
            .pending
            .range((Bound::Excluded(start), Bound::Unbounded))
            .filter(|(_, owner)| owner.as_str() == consumer)
            .filter_map(|(seq, _)| state.entries.get(seq).cloned())
            .take(max_count.max(1))
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &LogEntryId) -> Result<u64, LogError> {
        let Some(seq) = Self::parse_seq(id) else {
            return Err(LogError::MalformedEntry {
                id: id.clone(),
                reason: "not a log entry id".to_string(),
            });
        };
        let mut guard = self.inner.lock().await;
        let removed = guard
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&seq))
            .is_some();
        Ok(u64::from(removed))
    }

    async fn length(&self, stream: &str) -> Result<u64, LogError> {
        let guard = self.inner.lock().await;
        Ok(guard.streams.get(stream).map(|s| s.entries.len() as u64).unwrap_or(0))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, LogError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn range(&self, stream: &str, max_count: usize) -> Result<Vec<StreamEntry>, LogError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .streams
            .get(stream)
            .map(|s| s.entries.values().take(max_count).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, stream: &str, id: &LogEntryId) -> Result<Option<StreamEntry>, LogError> {
        let Some(seq) = Self::parse_seq(id) else {
            return Ok(None);
        };
        let guard = self.inner.lock().await;
        Ok(guard.streams.get(stream).and_then(|s| s.entries.get(&seq)).cloned())
    }

    async fn delete(&self, stream: &str, id: &LogEntryId) -> Result<bool, LogError> {
        let Some(seq) = Self::parse_seq(id) else {
            return Ok(false);
        };
        let mut guard = self.inner.lock().await;
        Ok(guard
            .streams
            .get_mut(stream)
            .map(|s| s.entries.remove(&seq).is_some())
            .unwrap_or(false))
    }

    async fn store_retry_count(&self, key: &str, id: &LogEntryId, count: u32) -> Result<(), LogError> {
        let mut guard = self.inner.lock().await;
        guard
            .retry_counts
            .entry(key.to_string())
            .or_default()
            .insert(id.0.clone(), count);
        Ok(())
    }

    async fn retry_count(&self, key: &str, id: &LogEntryId) -> Result<Option<u32>, LogError> {
        let guard = self.inner.lock().await;
        Ok(guard.retry_counts.get(key).and_then(|counts| counts.get(&id.0)).copied())
    }

    async fn clear_retry_count(&self, key: &str, id: &LogEntryId) -> Result<(), LogError> {
        let mut guard = self.inner.lock().await;
        if let Some(counts) = guard.retry_counts.get_mut(key) {
            counts.remove(&id.0);
        }
        Ok(())
    }

    async fn append_and_ack(
        &self,
        target: &str,
        fields: Fields,
        stream: &str,
        group: &str,
        id: &LogEntryId,
    ) -> Result<LogEntryId, LogError> {
        let seq = Self::parse_seq(id).ok_or_else(|| LogError::MalformedEntry {
            id: id.clone(),
            reason: "not a log entry id".to_string(),
        })?;
        let appended = {
            let mut guard = self.inner.lock().await;
            guard.next_seq += 1;
            let next = guard.next_seq;
            let appended = LogEntryId(format!("{}-0", next));
            let entry = StreamEntry {
                id: appended.clone(),
                fields: fields.into_iter().collect(),
            };
            guard.streams.entry(target.to_string()).or_default().entries.insert(next, entry);
            if let Some(g) = guard.streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
                g.pending.remove(&seq);
            }
            appended
        };
        self.appended.notify_waiters();
        Ok(appended)
    }
}
