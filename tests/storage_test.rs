use std::sync::Arc;
use std::time::Duration;

use webhook_relay::{DurableLog, InMemoryLog, LogEntryId, LogError};

const STREAM: &str = "webhook-stream";
const GROUP: &str = "relay-group";
const CONSUMER: &str = "relay-client";

fn fields(value: &str) -> Vec<(String, String)> {
    vec![("data".to_string(), value.to_string())]
}

#[tokio::test]
async fn test_read_group_delivers_in_append_order() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();

    let first = log.append(STREAM, fields("a")).await.unwrap();
    let second = log.append(STREAM, fields("b")).await.unwrap();

    let batch = log
        .read_group(STREAM, GROUP, CONSUMER, 10, Duration::from_millis(10))
        .await
        .unwrap();
    let ids: Vec<_> = batch.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec![first, second]);
    assert_eq!(batch[0].field("data"), Some("a"));

    // Already delivered entries are not handed out twice.
    let again = log
        .read_group(STREAM, GROUP, CONSUMER, 10, Duration::from_millis(10))
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 2);
}

#[tokio::test]
async fn test_read_group_respects_max_count() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();
    for i in 0..5 {
        log.append(STREAM, fields(&i.to_string())).await.unwrap();
    }

    let batch = log
        .read_group(STREAM, GROUP, CONSUMER, 2, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[1].field("data"), Some("1"));
}

#[tokio::test]
async fn test_ack_is_idempotent() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();
    let id = log.append(STREAM, fields("a")).await.unwrap();
    log.read_group(STREAM, GROUP, CONSUMER, 1, Duration::from_millis(10))
        .await
        .unwrap();

    assert_eq!(log.ack(STREAM, GROUP, &id).await.unwrap(), 1);
    assert_eq!(log.ack(STREAM, GROUP, &id).await.unwrap(), 0);
    assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 0);

    // Acked entries are not resurrected for the group.
    let batch = log
        .read_group(STREAM, GROUP, CONSUMER, 10, Duration::from_millis(10))
        .await
        .unwrap();
    assert!(batch.is_empty());
    assert!(log.read_pending(STREAM, GROUP, CONSUMER, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ensure_consumer_group_is_idempotent() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();
    log.append(STREAM, fields("a")).await.unwrap();
    log.read_group(STREAM, GROUP, CONSUMER, 10, Duration::from_millis(10))
        .await
        .unwrap();

    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();
    assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 1);
    assert_eq!(log.length(STREAM).await.unwrap(), 1);
}

#[tokio::test]
async fn test_read_without_group_fails() {
    let log = InMemoryLog::new();
    let err = log
        .read_group(STREAM, GROUP, CONSUMER, 10, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, LogError::MissingGroup { .. }));
}

#[tokio::test]
async fn test_blocking_read_wakes_on_append() {
    let log = Arc::new(InMemoryLog::new());
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();

    let reader = {
        let log = log.clone();
        tokio::spawn(async move {
            log.read_group(STREAM, GROUP, CONSUMER, 10, Duration::from_secs(5))
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    log.append(STREAM, fields("late")).await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader should wake up")
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].field("data"), Some("late"));
}

#[tokio::test]
async fn test_blocking_read_times_out_empty() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();

    let started = std::time::Instant::now();
    let batch = log
        .read_group(STREAM, GROUP, CONSUMER, 10, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(batch.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_read_pending_returns_only_own_entries() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();
    let mine = log.append(STREAM, fields("mine")).await.unwrap();
    log.read_group(STREAM, GROUP, CONSUMER, 1, Duration::from_millis(10))
        .await
        .unwrap();
    log.append(STREAM, fields("theirs")).await.unwrap();
    log.read_group(STREAM, GROUP, "other", 1, Duration::from_millis(10))
        .await
        .unwrap();

    let pending = log.read_pending(STREAM, GROUP, CONSUMER, None, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, mine);
}

#[tokio::test]
async fn test_read_pending_pages_after_cursor() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(log.append(STREAM, fields(&i.to_string())).await.unwrap());
    }
    log.read_group(STREAM, GROUP, CONSUMER, 5, Duration::from_millis(10))
        .await
        .unwrap();
    log.ack(STREAM, GROUP, &ids[1]).await.unwrap();

    let first = log.read_pending(STREAM, GROUP, CONSUMER, None, 2).await.unwrap();
    let first_ids: Vec<_> = first.iter().map(|e| e.id.clone()).collect();
    assert_eq!(first_ids, vec![ids[0].clone(), ids[2].clone()]);

    let rest = log
        .read_pending(STREAM, GROUP, CONSUMER, Some(&ids[2]), 10)
        .await
        .unwrap();
    let rest_ids: Vec<_> = rest.iter().map(|e| e.id.clone()).collect();
    assert_eq!(rest_ids, vec![ids[3].clone(), ids[4].clone()]);

    let done = log
        .read_pending(STREAM, GROUP, CONSUMER, Some(&ids[4]), 10)
        .await
        .unwrap();
    assert!(done.is_empty());
}

#[tokio::test]
async fn test_retry_counts_are_stored_per_entry() {
    let log = InMemoryLog::new();
    let key = "webhook-stream:relay-group:retries";
    let a = LogEntryId::from("1-0");
    let b = LogEntryId::from("2-0");

    assert_eq!(log.retry_count(key, &a).await.unwrap(), None);
    log.store_retry_count(key, &a, 1).await.unwrap();
    log.store_retry_count(key, &a, 2).await.unwrap();
    log.store_retry_count(key, &b, 5).await.unwrap();
    assert_eq!(log.retry_count(key, &a).await.unwrap(), Some(2));
    assert_eq!(log.retry_count("other-key", &a).await.unwrap(), None);

    log.clear_retry_count(key, &a).await.unwrap();
    log.clear_retry_count(key, &a).await.unwrap();
    assert_eq!(log.retry_count(key, &a).await.unwrap(), None);
    assert_eq!(log.retry_count(key, &b).await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_append_and_ack_moves_entry() {
    let log = InMemoryLog::new();
    log.ensure_consumer_group(STREAM, GROUP).await.unwrap();
    let id = log.append(STREAM, fields("doomed")).await.unwrap();
    log.read_group(STREAM, GROUP, CONSUMER, 1, Duration::from_millis(10))
        .await
        .unwrap();

    let moved = log
        .append_and_ack("webhook-dlq", fields("doomed"), STREAM, GROUP, &id)
        .await
        .unwrap();

    assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 0);
    assert_eq!(log.length("webhook-dlq").await.unwrap(), 1);
    let entry = log.get("webhook-dlq", &moved).await.unwrap().unwrap();
    assert_eq!(entry.field("data"), Some("doomed"));
}

#[tokio::test]
async fn test_range_get_and_delete() {
    let log = InMemoryLog::new();
    let a = log.append("webhook-dlq", fields("a")).await.unwrap();
    let b = log.append("webhook-dlq", fields("b")).await.unwrap();

    let all = log.range("webhook-dlq", 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(log.range("webhook-dlq", 1).await.unwrap()[0].id, a);

    assert!(log.delete("webhook-dlq", &a).await.unwrap());
    assert!(!log.delete("webhook-dlq", &a).await.unwrap());
    assert!(log.get("webhook-dlq", &a).await.unwrap().is_none());
    assert!(log.get("webhook-dlq", &b).await.unwrap().is_some());
    assert!(log.get("webhook-dlq", &LogEntryId::from("garbage")).await.unwrap().is_none());
}
