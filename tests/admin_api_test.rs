use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use webhook_relay::{
    client_router,
    ClientState,
    Envelope,
    InMemoryLog,
    LogEntryId,
    QueueNames,
    RelayMessage,
    RelayMetrics,
    RelayQueue,
};

async fn setup() -> (Router, RelayQueue, LogEntryId) {
    let queue = RelayQueue::new(Arc::new(InMemoryLog::new()), QueueNames::default());
    queue.ensure_group().await.unwrap();

    let mut message = RelayMessage::new(Envelope::new(b"undeliverable".to_vec()));
    let id = queue.enqueue(&message).await.unwrap();
    queue.read_batch(1, Duration::from_millis(10)).await.unwrap();
    message.retry_count = 3;
    let dlq_id = queue.dead_letter(&id, &message).await.unwrap();

    let app = client_router(ClientState {
        queue: queue.clone(),
        metrics: Arc::new(RelayMetrics::new()),
    });
    (app, queue, dlq_id)
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_list_dead_letters() {
    let (app, _queue, dlq_id) = setup().await;

    let response = app.oneshot(request("GET", "/api/dlq?limit=10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["entries"][0]["dlq_id"], dlq_id.0.as_str());
    assert_eq!(body["entries"][0]["message"]["retry_count"], 3);
}

#[tokio::test]
async fn test_replay_through_api() {
    let (app, queue, dlq_id) = setup().await;
    let depth = queue.queue_depth().await.unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", &format!("/api/dlq/{}", dlq_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert!(body["message_id"].is_string());

    assert_eq!(queue.queue_depth().await.unwrap(), depth + 1);
    assert_eq!(queue.dead_letter_depth().await.unwrap(), 0);

    // Replaying the same entry again finds nothing.
    let again = app
        .oneshot(request("POST", &format!("/api/dlq/{}", dlq_id)))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(again).await["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_delete_through_api() {
    let (app, queue, dlq_id) = setup().await;

    let response = app
        .clone()
        .oneshot(request("DELETE", &format!("/api/dlq/{}", dlq_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(queue.dead_letter_depth().await.unwrap(), 0);

    let missing = app
        .oneshot(request("DELETE", &format!("/api/dlq/{}", dlq_id)))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_client_health_and_metrics() {
    let (app, _queue, _dlq_id) = setup().await;

    let health = app.clone().oneshot(request("GET", "/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["pending"], 0);

    let metrics = app.oneshot(request("GET", "/api/metrics")).await.unwrap();
    let body = json_body(metrics).await;
    assert_eq!(body["dead_letters"], 1);
    assert_eq!(body["metrics"]["webhooks_processed"], 0);
}
