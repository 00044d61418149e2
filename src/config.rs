use serde::{Deserialize, Serialize};
use std::{env, str::FromStr};

/// Scope granted when a client or key does not ask for anything narrower.
pub const DEFAULT_SCOPE: &str = "mcp:full";

/// Advertised alongside the default scope for clients that ask for it.
pub const OFFLINE_ACCESS_SCOPE: &str = "offline_access";

/// Runtime configuration for the authorization server and the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP listener binds to.
    pub bind: String,
    /// Externally reachable base URL, used as the OAuth issuer.
    pub base_url: String,
    /// Scope advertised in challenges and granted by default.
    pub default_scope: String,
    /// Scopes advertised in discovery metadata.
    pub scopes_supported: Vec<String>,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub auth_code_ttl_secs: i64,
    /// Upper bound on how long a verified credential is trusted from cache.
    /// Revocations and deactivations made through this process invalidate
    /// the cache at once; changes written to the store by another process
    /// (e.g. the CLI against a shared database) take effect within this window.
    pub credential_cache_ttl_secs: u64,
    /// How long an unknown credential is remembered as invalid.
    pub negative_cache_ttl_secs: u64,
    pub credential_cache_capacity: usize,
    /// Sessions whose tenant selection is held in memory.
    pub session_cache_capacity: usize,
    /// Execution contexts unused for this long are dropped from memory.
    pub session_idle_ttl_secs: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: env::var("SCOPEGATE_BIND").unwrap_or_else(|_| "0.0.0.0:3942".to_string()),
            base_url: env::var("SCOPEGATE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3942".to_string()),
            default_scope: DEFAULT_SCOPE.to_string(),
            scopes_supported: vec![DEFAULT_SCOPE.to_string(), OFFLINE_ACCESS_SCOPE.to_string()],
            access_token_ttl_secs: env_or("SCOPEGATE_ACCESS_TOKEN_TTL", 3600),
            refresh_token_ttl_secs: env_or("SCOPEGATE_REFRESH_TOKEN_TTL", 30 * 24 * 3600),
            auth_code_ttl_secs: env_or("SCOPEGATE_AUTH_CODE_TTL", 600),
            credential_cache_ttl_secs: env_or("SCOPEGATE_CREDENTIAL_CACHE_TTL", 300),
            negative_cache_ttl_secs: env_or("SCOPEGATE_NEGATIVE_CACHE_TTL", 30),
            credential_cache_capacity: env_or("SCOPEGATE_CREDENTIAL_CACHE_CAPACITY", 10_000),
            session_cache_capacity: env_or("SCOPEGATE_SESSION_CACHE_CAPACITY", 10_000),
            session_idle_ttl_secs: env_or("SCOPEGATE_SESSION_IDLE_TTL", 24 * 3600),
        }
    }
}

impl ServerConfig {
    /// Issuer identifier: the base URL without a trailing slash.
    pub fn issuer(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// The protected resource served by the gateway.
    pub fn resource_url(&self) -> String {
        format!("{}/mcp", self.issuer())
    }

    /// Discovery document clients are pointed at from a 401 challenge.
    pub fn resource_metadata_url(&self) -> String {
        format!("{}/.well-known/oauth-protected-resource", self.issuer())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.issuer(), path)
    }

    pub fn is_supported_scope(&self, scope: &str) -> bool {
        self.scopes_supported.iter().any(|s| s == scope)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
