use serde::{Deserialize, Serialize};

use crate::types::{ApiKeyPrefix, ClientId, SessionId, TenantId, TokenHash, UserId};

// All timestamps are Unix seconds (UTC).

/// Persisted user account (table: `user`, keyed by `user_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    /// Login identifier, unique across users.
    pub email: String,
    pub name: Option<String>,
    /// Coarse role label carried into the principal (e.g., "member", "admin").
    pub role: String,
    /// bcrypt hash of the user's password.
    pub password_hash: String,
    /// Whether the user may authenticate.
    pub is_active: bool,
    pub created_at: i64,
}

/// Persisted tenant (table: `tenant`, keyed by `tenant_id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantRecord {
    pub tenant_id: TenantId,
    pub name: String,
    pub created_at: i64,
}

/// Membership of a user in a tenant (table: `tenant_member`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub role: String,
    pub created_at: i64,
}

/// Persisted API key (table: `api_key`, keyed by `key_hash`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// SHA-256 hash of the full API key (never store raw keys)
    pub key_hash: TokenHash,
    /// First part of the key for display/identification (e.g., "sgk_abc12345")
    pub key_prefix: ApiKeyPrefix,
    /// User who owns this key
    pub user_id: UserId,
    /// Tenant every request made with this key is bound to
    pub tenant_id: TenantId,
    /// Human-readable name for this key
    pub name: Option<String>,
    pub scopes: Vec<String>,
    /// Optional expiration time
    pub expires_at: Option<i64>,
    /// Set once the key is revoked; never cleared
    pub revoked_at: Option<i64>,
    /// Last time the key was used for authentication
    pub last_used_at: Option<i64>,
    pub created_at: i64,
}

impl ApiKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Registered OAuth client (table: `oauth_client`, keyed by `client_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientRecord {
    pub client_id: ClientId,
    /// Absent for public clients.
    pub secret_hash: Option<TokenHash>,
    pub client_name: String,
    /// Exact-match redirect targets.
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    /// Space-separated scopes this client may request.
    pub scope: String,
    pub confidential: bool,
    pub created_at: i64,
}

impl OAuthClientRecord {
    pub fn allows_grant(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    pub fn allowed_scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }
}

/// One-time authorization code (table: `oauth_code`, keyed by `code_hash`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCodeRecord {
    pub code_hash: TokenHash,
    pub client_id: ClientId,
    pub user_id: UserId,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub expires_at: i64,
    pub used: bool,
    pub created_at: i64,
}

/// Access + refresh token pair (table: `oauth_token`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenRecord {
    pub access_token_hash: TokenHash,
    pub refresh_token_hash: Option<TokenHash>,
    pub client_id: ClientId,
    pub user_id: UserId,
    /// Space-separated granted scopes.
    pub scope: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: Option<i64>,
    pub revoked: bool,
    pub created_at: i64,
}

impl OAuthTokenRecord {
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(str::to_string).collect()
    }
}

/// Durable tenant selection of a transport session (table: `session_scope`,
/// keyed by `session_id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionScopeRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub tenant_id: Option<TenantId>,
    pub updated_at: i64,
}
