#![cfg(feature = "redis")]

// These tests need a running Redis server and are disabled by default.
// Run them with: REDIS_URL=redis://localhost:6379 cargo test -- --ignored

use std::time::{Duration, Instant};

use webhook_relay::{DurableLog, LogEntryId, RedisLog};

const GROUP: &str = "relay-group";
const CONSUMER: &str = "relay-client";

async fn connect() -> RedisLog {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    RedisLog::connect(&url).await.unwrap()
}

/// A stream name no other test run uses.
fn stream_name(test: &str) -> String {
    format!("relay-test:{}:{}", test, uuid::Uuid::new_v4())
}

fn fields(value: &str) -> Vec<(String, String)> {
    vec![("data".to_string(), value.to_string())]
}

#[tokio::test]
#[ignore]
async fn test_redis_group_creation_is_idempotent() {
    let log = connect().await;
    let stream = stream_name("group");

    log.ensure_consumer_group(&stream, GROUP).await.unwrap();
    // The second call hits BUSYGROUP and must still succeed.
    log.ensure_consumer_group(&stream, GROUP).await.unwrap();
    assert_eq!(log.length(&stream).await.unwrap(), 0);
    assert_eq!(log.pending_count(&stream, GROUP).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_redis_read_group_ack_and_pending() {
    let log = connect().await;
    let stream = stream_name("ack");
    log.ensure_consumer_group(&stream, GROUP).await.unwrap();

    let first = log.append(&stream, fields("a")).await.unwrap();
    let second = log.append(&stream, fields("b")).await.unwrap();

    let batch = log
        .read_group(&stream, GROUP, CONSUMER, 10, Duration::from_millis(100))
        .await
        .unwrap();
    let ids: Vec<_> = batch.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec![first.clone(), second.clone()]);
    assert_eq!(batch[0].field("data"), Some("a"));
    assert_eq!(log.pending_count(&stream, GROUP).await.unwrap(), 2);

    assert_eq!(log.ack(&stream, GROUP, &first).await.unwrap(), 1);
    assert_eq!(log.ack(&stream, GROUP, &first).await.unwrap(), 0);
    assert_eq!(log.pending_count(&stream, GROUP).await.unwrap(), 1);

    // Acknowledged entries stay in the stream.
    assert_eq!(log.length(&stream).await.unwrap(), 2);
    let again = log
        .read_group(&stream, GROUP, CONSUMER, 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_redis_read_pending_pages_own_entries() {
    let log = connect().await;
    let stream = stream_name("pending");
    log.ensure_consumer_group(&stream, GROUP).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(log.append(&stream, fields(&i.to_string())).await.unwrap());
    }
    log.read_group(&stream, GROUP, CONSUMER, 3, Duration::from_millis(100))
        .await
        .unwrap();
    log.append(&stream, fields("theirs")).await.unwrap();
    log.read_group(&stream, GROUP, "other", 1, Duration::from_millis(100))
        .await
        .unwrap();

    let first = log.read_pending(&stream, GROUP, CONSUMER, None, 2).await.unwrap();
    let first_ids: Vec<_> = first.iter().map(|e| e.id.clone()).collect();
    assert_eq!(first_ids, vec![ids[0].clone(), ids[1].clone()]);
    assert_eq!(first[1].field("data"), Some("1"));

    let rest = log
        .read_pending(&stream, GROUP, CONSUMER, Some(&ids[1]), 2)
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, ids[2]);
}

#[tokio::test]
#[ignore]
async fn test_redis_blocking_read_waits_past_default_timeout() {
    let log = connect().await;
    let stream = stream_name("block");
    log.ensure_consumer_group(&stream, GROUP).await.unwrap();

    let started = Instant::now();
    let batch = log
        .read_group(&stream, GROUP, CONSUMER, 1, Duration::from_millis(1_200))
        .await
        .unwrap();
    assert!(batch.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(1_000));

    // Shared commands keep working after a long block.
    let id = log.append(&stream, fields("late")).await.unwrap();
    let batch = log
        .read_group(&stream, GROUP, CONSUMER, 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(batch[0].id, id);
}

#[tokio::test]
#[ignore]
async fn test_redis_append_and_ack_moves_entry() {
    let log = connect().await;
    let stream = stream_name("escalate");
    let dead_letter = format!("{}:dlq", stream);
    log.ensure_consumer_group(&stream, GROUP).await.unwrap();
    let id = log.append(&stream, fields("doomed")).await.unwrap();
    log.read_group(&stream, GROUP, CONSUMER, 1, Duration::from_millis(100))
        .await
        .unwrap();

    let moved = log
        .append_and_ack(&dead_letter, fields("doomed"), &stream, GROUP, &id)
        .await
        .unwrap();

    assert_eq!(log.pending_count(&stream, GROUP).await.unwrap(), 0);
    assert_eq!(log.length(&dead_letter).await.unwrap(), 1);
    let entry = log.get(&dead_letter, &moved).await.unwrap().unwrap();
    assert_eq!(entry.field("data"), Some("doomed"));
}

#[tokio::test]
#[ignore]
async fn test_redis_range_get_and_delete() {
    let log = connect().await;
    let stream = stream_name("range");
    let a = log.append(&stream, fields("a")).await.unwrap();
    let b = log.append(&stream, fields("b")).await.unwrap();

    assert_eq!(log.range(&stream, 10).await.unwrap().len(), 2);
    assert_eq!(log.range(&stream, usize::MAX).await.unwrap().len(), 2);
    assert_eq!(log.range(&stream, 1).await.unwrap()[0].id, a);

    assert!(log.delete(&stream, &a).await.unwrap());
    assert!(!log.delete(&stream, &a).await.unwrap());
    assert!(log.get(&stream, &a).await.unwrap().is_none());
    assert!(log.get(&stream, &b).await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
async fn test_redis_retry_counts() {
    let log = connect().await;
    let key = format!("{}:retries", stream_name("retries"));
    let id = LogEntryId::from("1-0");

    assert_eq!(log.retry_count(&key, &id).await.unwrap(), None);
    log.store_retry_count(&key, &id, 2).await.unwrap();
    assert_eq!(log.retry_count(&key, &id).await.unwrap(), Some(2));
    log.clear_retry_count(&key, &id).await.unwrap();
    log.clear_retry_count(&key, &id).await.unwrap();
    assert_eq!(log.retry_count(&key, &id).await.unwrap(), None);
}
