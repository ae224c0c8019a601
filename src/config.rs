//! Command-line and environment configuration for both binaries.
//!
//! Every option can be given as a flag or through the environment (a `.env`
//! file is loaded by the binaries before parsing).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::consumer::ConsumerConfig;
use crate::error::RelayError;
use crate::queue::QueueNames;
use crate::retry::RetryPolicy;

/// Log location shared by server and client.
#[derive(Debug, Clone, Args)]
pub struct LogArgs {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Main webhook stream
    #[arg(long, env = "STREAM_NAME", default_value = "webhook-stream")]
    pub stream_name: String,

    /// Consumer group reading the main stream
    #[arg(long, env = "CONSUMER_GROUP", default_value = "relay-group")]
    pub consumer_group: String,

    /// Dead-letter stream
    #[arg(long, env = "DEAD_LETTER_QUEUE", default_value = "webhook-dlq")]
    pub dead_letter_queue: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl LogArgs {
    pub fn queue_names(&self, consumer: &str) -> QueueNames {
        QueueNames {
            stream: self.stream_name.clone(),
            group: self.consumer_group.clone(),
            consumer: consumer.to_string(),
            dead_letter: self.dead_letter_queue.clone(),
        }
    }

    fn collect_problems(&self, problems: &mut Vec<String>) {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            problems.push(format!("REDIS_URL must use redis:// or rediss://, got '{}'", self.redis_url));
        }
        for (name, value) in [
            ("STREAM_NAME", &self.stream_name),
            ("CONSUMER_GROUP", &self.consumer_group),
            ("DEAD_LETTER_QUEUE", &self.dead_letter_queue),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} must not be empty", name));
            }
        }
        if self.stream_name == self.dead_letter_queue {
            problems.push("STREAM_NAME and DEAD_LETTER_QUEUE must differ".to_string());
        }
    }
}

/// Public webhook receiver.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay-server", about = "Accept webhooks and queue them for relay")]
pub struct ServerConfig {
    #[command(flatten)]
    pub log: LogArgs,

    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Relay-wide API key accepted on /webhook
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Header carrying the API key
    #[arg(long, env = "API_KEY_HEADER", default_value = "X-API-Key")]
    pub api_key_header: String,

    /// Header whose value is carried as the webhook signature
    #[arg(long, env = "SIGNATURE_HEADER", default_value = "X-Hub-Signature")]
    pub signature_header: String,

    /// TOML file with per-platform routes
    #[arg(long, env = "ROUTES_FILE")]
    pub routes_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        let mut problems = Vec::new();
        self.log.collect_problems(&mut problems);
        if self.api_key.trim().is_empty() {
            problems.push("API_KEY must not be empty".to_string());
        }
        if self.api_key_header.trim().is_empty() {
            problems.push("API_KEY_HEADER must not be empty".to_string());
        }
        if let Some(path) = &self.routes_file {
            if !path.is_file() {
                problems.push(format!("ROUTES_FILE '{}' does not exist", path.display()));
            }
        }
        into_result(problems)
    }
}

/// Private consumer forwarding to the local endpoint.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay-client", about = "Forward queued webhooks to a local endpoint")]
pub struct ClientConfig {
    #[command(flatten)]
    pub log: LogArgs,

    /// Consumer name within the group
    #[arg(long, env = "CONSUMER_NAME", default_value = "relay-client")]
    pub consumer_name: String,

    /// Default forward target
    #[arg(long, env = "LOCAL_WEBHOOK_URL", default_value = "http://localhost:3000/webhook")]
    pub local_webhook_url: String,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Initial retry delay in milliseconds
    #[arg(long, env = "RETRY_DELAY", default_value_t = 1_000)]
    pub retry_delay_ms: u64,

    #[arg(long, env = "RETRY_MULTIPLIER", default_value_t = 2.0)]
    pub retry_multiplier: f64,

    /// Forward request timeout in seconds
    #[arg(long, env = "FORWARD_TIMEOUT", default_value_t = 30)]
    pub forward_timeout_secs: u64,

    #[arg(long, env = "BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    /// Longest blocking read in milliseconds
    #[arg(long, env = "BLOCK_TIMEOUT", default_value_t = 5_000)]
    pub block_timeout_ms: u64,

    /// Pause after a failed read in milliseconds
    #[arg(long, env = "READ_ERROR_BACKOFF", default_value_t = 5_000)]
    pub read_error_backoff_ms: u64,

    /// Address for the health and dead-letter API
    #[arg(long, env = "ADMIN_ADDR", default_value = "127.0.0.1:8081")]
    pub admin_addr: SocketAddr,

    /// Seconds between metrics log lines
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value_t = 30)]
    pub health_check_interval_secs: u64,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        let mut problems = Vec::new();
        self.log.collect_problems(&mut problems);
        if self.consumer_name.trim().is_empty() {
            problems.push("CONSUMER_NAME must not be empty".to_string());
        }
        if reqwest::Url::parse(&self.local_webhook_url).is_err() {
            problems.push(format!("LOCAL_WEBHOOK_URL '{}' is not a valid URL", self.local_webhook_url));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            problems.push("RETRY_MULTIPLIER must be a finite number >= 1.0".to_string());
        }
        if self.forward_timeout_secs == 0 {
            problems.push("FORWARD_TIMEOUT must be positive".to_string());
        }
        if self.batch_size == 0 {
            problems.push("BATCH_SIZE must be positive".to_string());
        }
        if self.block_timeout_ms == 0 {
            problems.push("BLOCK_TIMEOUT must be positive".to_string());
        }
        if self.read_error_backoff_ms == 0 {
            problems.push("READ_ERROR_BACKOFF must be positive".to_string());
        }
        if self.health_check_interval_secs == 0 {
            problems.push("HEALTH_CHECK_INTERVAL must be positive".to_string());
        }
        into_result(problems)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_delay_ms),
            self.retry_multiplier,
        )
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.batch_size,
            block_timeout: Duration::from_millis(self.block_timeout_ms),
            read_error_backoff: Duration::from_millis(self.read_error_backoff_ms),
            default_target: self.local_webhook_url.clone(),
            retry_policy: self.retry_policy(),
        }
    }
}

fn into_result(problems: Vec<String>) -> Result<(), RelayError> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(RelayError::InvalidConfig(problems.join("; ")))
    }
}
