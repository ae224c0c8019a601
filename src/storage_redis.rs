#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::aio::{ConnectionManager, MultiplexedConnection};
#[cfg(feature = "redis")]
use redis::streams::{StreamId, StreamPendingReply, StreamRangeReply, StreamReadReply};
#[cfg(feature = "redis")]
use tokio::sync::Mutex;

#[cfg(feature = "redis")]
use crate::error::LogError;
#[cfg(feature = "redis")]
use crate::storage::{DurableLog, Fields};
#[cfg(feature = "redis")]
use crate::types::{LogEntryId, StreamEntry};

/// Extra time a blocking read may take beyond its `BLOCK` argument.
#[cfg(feature = "redis")]
const READER_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Durable log backed by Redis Streams.
///
/// Short commands share one reconnecting connection. Blocking group reads
/// run on a dedicated connection so a long `BLOCK` never stalls appends or
/// acknowledgements issued from the same process.
#[cfg(feature = "redis")]
pub struct RedisLog {
    client: redis::Client,
    conn: ConnectionManager,
    reader: Mutex<Option<MultiplexedConnection>>,
}

#[cfg(feature = "redis")]
impl RedisLog {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, LogError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client.clone()).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            client,
            conn,
            reader: Mutex::new(None),
        })
    }

    fn entry_from(stream_id: StreamId) -> StreamEntry {
        let fields = stream_id
            .map
            .iter()
            .filter_map(|(name, value)| {
                redis::from_redis_value_ref::<String>(value)
                    .ok()
                    .map(|v| (name.clone(), v))
            })
            .collect();
        StreamEntry {
            id: LogEntryId(stream_id.id),
            fields,
        }
    }

    fn entries_from(reply: StreamReadReply) -> Vec<StreamEntry> {
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids.into_iter())
            .map(Self::entry_from)
            .collect()
    }

    fn xadd(stream: &str, fields: &Fields) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (name, value) in fields {
            cmd.arg(name).arg(value);
        }
        cmd
    }

    async fn reader(&self) -> Result<MultiplexedConnection, LogError> {
        let mut guard = self.reader.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_reader(&self) {
        self.reader.lock().await.take();
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        start: &str,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(max_count.max(1));
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(start);

        let result: Result<Option<StreamReadReply>, redis::RedisError> = match block {
            Some(block) => {
                let mut conn = self.reader().await?;
                conn.set_response_timeout(block + READER_TIMEOUT_MARGIN);
                let result = cmd.query_async(&mut conn).await;
                if result.is_err() {
                    self.reset_reader().await;
                }
                result
            }
            None => {
                let mut conn = self.conn.clone();
                cmd.query_async(&mut conn).await
            }
        };

        Ok(result?.map(Self::entries_from).unwrap_or_default())
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl DurableLog for RedisLog {
    async fn append(&self, stream: &str, fields: Fields) -> Result<LogEntryId, LogError> {
        let mut conn = self.conn.clone();
        let id: String = Self::xadd(stream, &fields).query_async(&mut conn).await?;
        Ok(LogEntryId(id))
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError> {
        self.xreadgroup(stream, group, consumer, max_count, ">", Some(block)).await
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: Option<&LogEntryId>,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let start = after.map(|id| id.0.as_str()).unwrap_or("0");
        self.xreadgroup(stream, group, consumer, max_count, start, None).await
    }

    async fn ack(&self, stream: &str, group: &str, id: &LogEntryId) -> Result<u64, LogError> {
        let mut conn = self.conn.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(&id.0)
            .query_async(&mut conn)
            .await?;
        Ok(acked)
    }

    async fn length(&self, stream: &str) -> Result<u64, LogError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("XLEN").arg(stream).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, LogError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;
        Ok(reply.count() as u64)
    }

    async fn range(&self, stream: &str, max_count: usize) -> Result<Vec<StreamEntry>, LogError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(max_count.clamp(1, i64::MAX as usize))
            .query_async(&mut conn)
            .await?;
        Ok(reply.ids.into_iter().map(Self::entry_from).collect())
    }

    async fn get(&self, stream: &str, id: &LogEntryId) -> Result<Option<StreamEntry>, LogError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(&id.0)
            .arg(&id.0)
            .query_async(&mut conn)
            .await?;
        Ok(reply.ids.into_iter().next().map(Self::entry_from))
    }

    async fn delete(&self, stream: &str, id: &LogEntryId) -> Result<bool, LogError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("XDEL").arg(stream).arg(&id.0).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn store_retry_count(&self, key: &str, id: &LogEntryId, count: u32) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("HSET")
            .arg(key)
            .arg(&id.0)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry_count(&self, key: &str, id: &LogEntryId) -> Result<Option<u32>, LogError> {
        let mut conn = self.conn.clone();
        let count: Option<u32> = redis::cmd("HGET").arg(key).arg(&id.0).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn clear_retry_count(&self, key: &str, id: &LogEntryId) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("HDEL").arg(key).arg(&id.0).query_async(&mut conn).await?;
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
        let mut conn = self.conn.clone();
        let (appended, _acked): (String, u64) = redis::pipe()
            .atomic()
            .add_command(Self::xadd(target, &fields))
            .cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(&id.0)
            .query_async(&mut conn)
            .await?;
        Ok(LogEntryId(appended))
    }
}
