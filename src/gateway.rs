//! Transport-independent webhook ingestion.
//!
//! The gateway owns the accept/reject decision for an inbound webhook. A
//! success response is only produced after the message has been durably
//! appended to the log.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RelayError;
use crate::metrics::MetricsSink;
use crate::queue::RelayQueue;
use crate::routing::{Authorization, RouteResolver};
use crate::signing::{verify_webhook_request, VerificationError};
use crate::types::{Envelope, EnvelopeId, LogEntryId, RelayMessage};

pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Hub-Signature";

/// A webhook as received, before any checks.
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    pub method: String,
    /// Platform path segment, if the request used a routed path.
    pub platform: Option<String>,
    /// Header pairs in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl InboundWebhook {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Acknowledgement returned once a webhook is durably queued.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub message_id: LogEntryId,
    pub webhook_id: EnvelopeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct IngestionGateway {
    queue: RelayQueue,
    resolver: Arc<dyn RouteResolver>,
    metrics: Arc<dyn MetricsSink>,
    api_key_header: String,
    signature_header: String,
}

impl IngestionGateway {
    pub fn new(queue: RelayQueue, resolver: Arc<dyn RouteResolver>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            queue,
            resolver,
            metrics,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
        }
    }

    pub fn with_api_key_header(mut self, name: impl Into<String>) -> Self {
        self.api_key_header = name.into();
        self
    }

    pub fn with_signature_header(mut self, name: impl Into<String>) -> Self {
        self.signature_header = name.into();
        self
    }

    pub fn queue(&self) -> &RelayQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub async fn ingest(&self, inbound: InboundWebhook) -> Result<Accepted, RelayError> {
        let started = Instant::now();

        if !inbound.method.eq_ignore_ascii_case("POST") {
            return Err(RelayError::MethodNotAllowed(inbound.method));
        }

        let api_key = inbound
            .header(&self.api_key_header)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| RelayError::AuthenticationFailed("API key required".to_string()))?;

        let route = match self.resolver.authorize(api_key, inbound.platform.as_deref()).await? {
            Authorization::Static => None,
            Authorization::Platform(route) => Some(route),
        };

        if let Some(secret) = route.as_ref().and_then(|r| r.signing_secret.as_deref()) {
            let headers = inbound.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()));
            verify_webhook_request(headers, &inbound.body, secret.as_bytes()).map_err(|err| {
                let detail = match err {
                    VerificationError::MissingSignature => "missing platform signature",
                    VerificationError::MalformedSignature => "malformed platform signature",
                    VerificationError::InvalidSignature => "invalid platform signature",
                };
                RelayError::AuthenticationFailed(detail.to_string())
            })?;
        }

        if inbound.body.is_empty() {
            return Err(RelayError::InvalidRequest("request body is required".to_string()));
        }

        let signature = inbound.header(&self.signature_header).map(str::to_string);
        let mut envelope = Envelope::new(inbound.body).with_headers(inbound.headers);
        if let Some(signature) = signature {
            envelope = envelope.with_signature(signature);
        }
        let mut message = match &route {
            Some(route) => RelayMessage::new(envelope.with_route(route)).with_route(route),
            None => RelayMessage::new(envelope),
        };
        message.created_at = message.envelope.timestamp();

        let message_id = self.queue.enqueue(&message).await?;

        let accepted = Accepted {
            message_id,
            webhook_id: message.envelope.id().clone(),
            platform: message.envelope.platform().map(str::to_string),
            timestamp: message.envelope.timestamp(),
        };
        self.metrics.record_received(accepted.timestamp, started.elapsed());
        tracing::info!(
            message_id = %accepted.message_id,
            webhook_id = %accepted.webhook_id,
            platform = accepted.platform.as_deref().unwrap_or("-"),
            "webhook accepted"
        );
        Ok(accepted)
    }
}
