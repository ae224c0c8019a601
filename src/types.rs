use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::routing::RouteTarget;

/// Unique identifier for a captured webhook.
///
/// Generated once by the ingestion gateway and never changed afterwards,
/// including across retries and dead-letter replays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(pub String);

impl EnvelopeId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the durable log to an appended entry.
///
/// Totally ordered within one stream; opaque to everything but the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogEntryId(pub String);

impl fmt::Display for LogEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogEntryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A captured inbound webhook.
///
/// The relay treats the body as opaque bytes. Identifier and body are fixed
/// at construction; there are no mutators for either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    headers: BTreeMap<String, String>,
    #[serde(with = "body_base64")]
    body: Vec<u8>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http_method: Option<String>,
}

impl Envelope {
    /// Capture a webhook received now, with a freshly generated identifier.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self::with_id(EnvelopeId::generate(), body, Utc::now())
    }

    /// Build an envelope with an explicit identifier and reception time.
    pub fn with_id(id: EnvelopeId, body: impl Into<Vec<u8>>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            headers: BTreeMap::new(),
            body: body.into(),
            timestamp,
            signature: None,
            platform: None,
            endpoint_id: None,
            http_method: None,
        }
    }

    /// Capture request headers.
    ///
    /// Names keep the case they arrive with. When a name repeats, the first
    /// value wins.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.headers.entry(name.into()).or_insert_with(|| value.into());
        }
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Stamp routing metadata from a resolved platform route.
    pub fn with_route(mut self, route: &RouteTarget) -> Self {
        self.platform = Some(route.platform.clone());
        self.endpoint_id = route.endpoint_id.clone();
        self.http_method = route.http_method.clone();
        self
    }

    pub fn with_http_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = Some(method.into());
        self
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        self.endpoint_id.as_deref()
    }

    pub fn http_method(&self) -> Option<&str> {
        self.http_method.as_deref()
    }
}

/// The record persisted in the main log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub envelope: Envelope,

    /// Number of failed forwarding attempts. Only ever incremented.
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,

    /// Target URL resolved at ingestion; the client default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_endpoint: Option<String>,

    /// Per-route retry override resolved at ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl RelayMessage {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            retry_count: 0,
            created_at: Utc::now(),
            target_endpoint: None,
            retry_policy: None,
        }
    }

    /// Carry the delivery parts of a resolved route.
    pub fn with_route(mut self, route: &RouteTarget) -> Self {
        self.target_endpoint = route.target_url.clone();
        self.retry_policy = route.retry_policy.clone();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_endpoint = Some(target.into());
        self
    }

    /// A fresh live record for the same envelope, as used by dead-letter replay.
    pub fn replayed(&self) -> Self {
        Self {
            envelope: self.envelope.clone(),
            retry_count: 0,
            created_at: Utc::now(),
            target_endpoint: self.target_endpoint.clone(),
            retry_policy: self.retry_policy.clone(),
        }
    }
}

/// Dead-letter queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Identifier of this entry inside the dead-letter stream.
    pub dlq_id: LogEntryId,

    /// Identifier the message had in the main log.
    pub original_id: LogEntryId,

    pub message: RelayMessage,

    pub moved_at: DateTime<Utc>,
}

/// A raw entry read back from a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: LogEntryId,
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
