//! Credential checks and platform routing for inbound webhooks.
//!
//! A request either carries the relay-wide static key, or targets
//! `/webhook/{platform}` with that platform's own key. Routing is resolved
//! exactly once per request into a [`RouteTarget`] that travels with the
//! message; nothing downstream looks the platform up again.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::retry::RetryPolicy;
use crate::signing::keys_match;

/// Delivery settings resolved for one platform-routed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub platform: String,
    pub endpoint_id: Option<String>,
    pub target_url: Option<String>,
    pub http_method: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    /// Secret used to verify the platform's own body signature.
    #[serde(skip_serializing)]
    pub signing_secret: Option<String>,
}

/// Outcome of a successful credential check.
#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    /// The relay-wide static key; no routing metadata.
    Static,
    /// A platform key, with its resolved route.
    Platform(RouteTarget),
}

/// Authenticates inbound credentials and resolves their route.
///
/// Credential storage and management live outside the relay; this is the
/// lookup the ingestion path needs from it.
#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn authorize(&self, api_key: &str, platform: Option<&str>) -> Result<Authorization, RelayError>;
}

/// One platform as configured in the routes file.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformRoute {
    pub name: String,
    pub api_key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub endpoint_id: Option<String>,
    pub target_url: Option<String>,
    pub http_method: Option<String>,
    pub retry: Option<RetryPolicy>,
    pub signing_secret: Option<String>,
}

fn default_active() -> bool {
    true
}

impl PlatformRoute {
    fn target(&self) -> RouteTarget {
        RouteTarget {
            platform: self.name.clone(),
            endpoint_id: self.endpoint_id.clone(),
            target_url: self.target_url.clone(),
            http_method: self.http_method.clone(),
            retry_policy: self.retry.clone(),
            signing_secret: self.signing_secret.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    platforms: Vec<PlatformRoute>,
}

/// Routes held in memory, typically loaded once at startup.
#[derive(Debug, Clone)]
pub struct StaticRoutes {
    static_key: String,
    platforms: HashMap<String, PlatformRoute>,
}

impl StaticRoutes {
    /// Accept only the relay-wide key.
    pub fn new(static_key: impl Into<String>) -> Self {
        Self {
            static_key: static_key.into(),
            platforms: HashMap::new(),
        }
    }

    pub fn with_platform(mut self, route: PlatformRoute) -> Self {
        self.platforms.insert(route.name.clone(), route);
        self
    }

    /// Parse `[[platforms]]` tables from TOML.
    pub fn from_toml(static_key: impl Into<String>, source: &str) -> Result<Self, RelayError> {
        let file: RoutesFile = toml::from_str(source)
            .map_err(|e| RelayError::InvalidConfig(format!("routes file: {}", e)))?;
        Ok(file
            .platforms
            .into_iter()
            .fold(Self::new(static_key), |routes, route| routes.with_platform(route)))
    }

    pub fn load(static_key: impl Into<String>, path: &Path) -> Result<Self, RelayError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            RelayError::InvalidConfig(format!("failed to read routes file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(static_key, &source)
    }

    pub fn platform_count(&self) -> usize {
        self.platforms.len()
    }
}

#[async_trait]
impl RouteResolver for StaticRoutes {
    async fn authorize(&self, api_key: &str, platform: Option<&str>) -> Result<Authorization, RelayError> {
        let Some(platform) = platform else {
            if keys_match(&self.static_key, api_key) {
                return Ok(Authorization::Static);
            }
            return Err(RelayError::AuthenticationFailed("invalid API key".to_string()));
        };

        match self.platforms.get(platform) {
            Some(route) if route.active && keys_match(&route.api_key, api_key) => {
                Ok(Authorization::Platform(route.target()))
            }
            _ => Err(RelayError::AuthenticationFailed(
                "invalid API key for platform".to_string(),
            )),
        }
    }
}
