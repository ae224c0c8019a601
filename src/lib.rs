//! A durable webhook relay.
//!
//! A public **relay server** accepts webhooks, wraps each one in an
//! envelope and appends it to a durable log (a Redis stream with a consumer
//! group). A private **relay client** behind a firewall reads the log and
//! forwards every webhook to a local endpoint, retrying with exponential
//! backoff and moving exhausted messages to a dead-letter stream.
//!
//! ## Guarantees
//! - A `202` is only returned after the webhook is durably appended
//! - At-least-once delivery to the local endpoint
//! - Bounded retries, also across restarts; every message ends acknowledged
//!   or dead-lettered
//! - Log order is preserved by the single delivery consumer
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across different targets
//! - Multiple cooperating consumer processes
//! - Payload transformation or validation
//!
//! Credential management, user accounts and dashboards are outside this
//! crate; it consumes them through [`RouteResolver`].

mod config;
mod consumer;
mod error;
mod forwarder;
mod gateway;
mod http;
mod logging;
mod metrics;
mod queue;
mod retry;
mod routing;
mod signing;
mod storage;
mod types;

#[cfg(feature = "redis")]
mod storage_redis;

pub use config::{ClientConfig, LogArgs, ServerConfig};
pub use consumer::{ConsumerConfig, DeliveryConsumer};
pub use error::{FailureReason, LogError, RelayError};
pub use forwarder::{
    is_forwardable_header,
    outbound_headers,
    ForwardReceipt,
    Forwarder,
    HttpForwarder,
    HOP_BY_HOP_HEADERS,
    RELAY_SIGNATURE_HEADER,
    RELAY_TIMESTAMP_HEADER,
    RELAY_WEBHOOK_ID_HEADER,
};
pub use gateway::{
    Accepted,
    InboundWebhook,
    IngestionGateway,
    DEFAULT_API_KEY_HEADER,
    DEFAULT_SIGNATURE_HEADER,
};
pub use http::{client_router, server_router, ClientState, ServerState};
pub use logging::init_logging;
pub use metrics::{MetricsSink, MetricsSnapshot, RelayMetrics};
pub use queue::{parse_entry, Delivery, QueueNames, RelayQueue};
pub use retry::{decide, RetryDecision, RetryPolicy};
pub use routing::{Authorization, PlatformRoute, RouteResolver, RouteTarget, StaticRoutes};
pub use signing::{
    compute_signature,
    keys_match,
    verify_signature,
    verify_webhook_request,
    VerificationError,
    PLATFORM_SIGNATURE_HEADER,
};
pub use storage::{DurableLog, Fields, InMemoryLog};
pub use types::{DlqEntry, Envelope, EnvelopeId, LogEntryId, RelayMessage, StreamEntry};

#[cfg(feature = "redis")]
pub use storage_redis::RedisLog;
