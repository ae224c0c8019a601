use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

use crate::error::FailureReason;
use crate::types::Envelope;

pub const RELAY_WEBHOOK_ID_HEADER: &str = "X-Relay-Webhook-ID";
pub const RELAY_TIMESTAMP_HEADER: &str = "X-Relay-Timestamp";
pub const RELAY_SIGNATURE_HEADER: &str = "X-Relay-Signature";

/// Headers meaningful only for a single transport hop.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Set by the HTTP client for the outbound request itself.
const TRANSPORT_HEADERS: [&str; 2] = ["host", "content-length"];

/// Result of a successful forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardReceipt {
    pub status: u16,
    pub latency: Duration,
}

/// Delivers one envelope to one target. Implementations make exactly one
/// attempt; retrying is the caller's decision.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, envelope: &Envelope, target: &str) -> Result<ForwardReceipt, FailureReason>;
}

/// Whether a captured header is copied onto the outbound request.
pub fn is_forwardable_header(name: &str) -> bool {
    !HOP_BY_HOP_HEADERS
        .iter()
        .chain(TRANSPORT_HEADERS.iter())
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Build the outbound header set: filtered envelope headers plus the relay
/// provenance headers. Headers that cannot be represented are dropped.
pub fn outbound_headers(envelope: &Envelope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in envelope.headers() {
        if !is_forwardable_header(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => {
                tracing::debug!(header = %name, "dropping unrepresentable header");
            }
        }
    }

    let timestamp = envelope.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true);
    let provenance = [
        (RELAY_WEBHOOK_ID_HEADER, Some(envelope.id().0.as_str())),
        (RELAY_TIMESTAMP_HEADER, Some(timestamp.as_str())),
        (RELAY_SIGNATURE_HEADER, envelope.signature()),
    ];
    for (name, value) in provenance {
        let Some(value) = value else { continue };
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Forwarder over HTTP with a bounded per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, envelope: &Envelope, target: &str) -> Result<ForwardReceipt, FailureReason> {
        let method = match envelope.http_method() {
            Some(method) => Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|_| FailureReason::InvalidRequest(format!("unsupported method {}", method)))?,
            None => Method::POST,
        };
        let url = reqwest::Url::parse(target)
            .map_err(|e| FailureReason::InvalidRequest(format!("target url: {}", e)))?;

        let started = Instant::now();
        let response = self
            .client
            .request(method, url)
            .headers(outbound_headers(envelope))
            .body(envelope.body().to_vec())
            .timeout(self.timeout)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(ForwardReceipt {
                status: resp.status().as_u16(),
                latency: started.elapsed(),
            }),
            Ok(resp) => Err(FailureReason::RemoteStatus(resp.status().as_u16())),
            Err(err) if err.is_timeout() => Err(FailureReason::Timeout),
            Err(err) if err.is_builder() => Err(FailureReason::InvalidRequest(err.to_string())),
            Err(err) => Err(FailureReason::Network(err.to_string())),
        }
    }
}
