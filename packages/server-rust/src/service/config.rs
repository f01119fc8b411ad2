use serde::Deserialize;

/// Hub-level configuration.
///
/// Every field has a default, so a partial JSON document only needs to name
/// what it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Identifier stamped as `from` on hub-originated messages.
    pub node_id: String,
    /// Shared worker pool sizing.
    pub pool: PoolConfig,
    /// Upper bound a caller waits for a response, in milliseconds.
    pub request_timeout_ms: u64,
    /// Timeout applied to local route handlers, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Timeout of a single relay round trip to a provider, in milliseconds.
    pub relay_timeout_ms: u64,
    pub throttle: ThrottleConfig,
    pub auth: AuthConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_id: "hub".to_string(),
            pool: PoolConfig::default(),
            request_timeout_ms: 30_000,
            handler_timeout_ms: 10_000,
            relay_timeout_ms: 10_000,
            throttle: ThrottleConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl HubConfig {
    /// Parses a JSON document, filling unspecified fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed input.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Worker pool sizing. Values are clamped by the pool itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub worker_size: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_size: 16,
            queue_capacity: 1024,
        }
    }
}

/// Per-source-address rate limiting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Length of one counting window, in milliseconds.
    pub window_ms: u64,
    /// Hits allowed per window before requests are rejected.
    pub max_hits_per_window: u32,
    /// Penalty points at which a source is moved into the blocklist.
    pub escalation_threshold: u32,
    /// How long an escalated source stays blocked; `None` blocks permanently.
    pub blocklist_duration_ms: Option<u64>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 1_000,
            max_hits_per_window: 200,
            escalation_threshold: 1_000,
            blocklist_duration_ms: Some(600_000),
        }
    }
}

/// Credential resolution for the auth middleware.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for JWT bearer tokens. JWT support is off when `None`.
    pub jwt_secret: Option<String>,
    /// Opaque API tokens mapped to principals.
    pub static_tokens: Vec<StaticTokenConfig>,
    /// Maximum number of resolved credentials kept in the cache.
    pub cache_capacity: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            static_tokens: Vec::new(),
            cache_capacity: 4_096,
        }
    }
}

/// One opaque API token.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticTokenConfig {
    pub token: String,
    pub principal_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}
