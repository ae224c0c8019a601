use std::time::Duration;

use clap::Parser;
use webhook_relay::{ClientConfig, RelayError, RetryPolicy, ServerConfig};

#[test]
fn test_client_defaults() {
    let config = ClientConfig::try_parse_from(["relay-client"]).unwrap();
    config.validate().unwrap();

    assert_eq!(config.retry_policy(), RetryPolicy::new(3, Duration::from_millis(1_000), 2.0));
    assert_eq!(config.forward_timeout(), Duration::from_secs(30));

    let consumer = config.consumer_config();
    assert_eq!(consumer.batch_size, 10);
    assert_eq!(consumer.block_timeout, Duration::from_millis(5_000));
    assert_eq!(consumer.default_target, "http://localhost:3000/webhook");

    let names = config.log.queue_names(&config.consumer_name);
    assert_eq!(names.stream, "webhook-stream");
    assert_eq!(names.group, "relay-group");
    assert_eq!(names.dead_letter, "webhook-dlq");
}

#[test]
fn test_client_validation_reports_every_problem() {
    let config = ClientConfig::try_parse_from([
        "relay-client",
        "--batch-size",
        "0",
        "--retry-multiplier",
        "0.5",
        "--local-webhook-url",
        "not a url",
    ])
    .unwrap();

    let err = config.validate().unwrap_err();
    assert_eq!(err.code(), "INVALID_CONFIG");
    let RelayError::InvalidConfig(message) = err else {
        panic!("expected invalid config");
    };
    assert!(message.contains("BATCH_SIZE"));
    assert!(message.contains("RETRY_MULTIPLIER"));
    assert!(message.contains("LOCAL_WEBHOOK_URL"));
}

#[test]
fn test_server_requires_api_key() {
    let parsed = ServerConfig::try_parse_from(["relay-server", "--api-key", "secret"]).unwrap();
    parsed.validate().unwrap();
    assert_eq!(parsed.api_key_header, "X-API-Key");
    assert_eq!(parsed.listen_addr.port(), 8080);

    let blank = ServerConfig::try_parse_from(["relay-server", "--api-key", " "]).unwrap();
    assert!(blank.validate().is_err());
}

#[test]
fn test_stream_and_dead_letter_must_differ() {
    let config = ServerConfig::try_parse_from([
        "relay-server",
        "--api-key",
        "secret",
        "--stream-name",
        "same",
        "--dead-letter-queue",
        "same",
    ])
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_read_error_backoff_is_rejected() {
    let config = ClientConfig::try_parse_from(["relay-client", "--read-error-backoff-ms", "0"]).unwrap();
    let RelayError::InvalidConfig(message) = config.validate().unwrap_err() else {
        panic!("expected invalid config");
    };
    assert!(message.contains("READ_ERROR_BACKOFF"));
}
