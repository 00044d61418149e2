//! Normalized result of credential verification.

use serde::{Deserialize, Serialize};

use crate::types::{ApiKeyPrefix, ClientId, TenantId, UserId};

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::OAuth => "oauth",
        }
    }
}

/// Credential-specific facts carried alongside the user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_mode", rename_all = "snake_case")]
pub enum Grant {
    /// A long-lived key, permanently bound to one tenant.
    ApiKey {
        key_prefix: ApiKeyPrefix,
        tenant_id: TenantId,
    },
    /// A delegated access token; the tenant is chosen per session.
    #[serde(rename = "oauth")]
    OAuth { client_id: ClientId },
}

/// The authenticated caller.
///
/// Built once by the authenticator and passed by value or reference through
/// every subsequent call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub scopes: Vec<String>,
    /// Unix seconds after which the credential stops working, if bounded.
    pub expires_at: Option<i64>,
    pub grant: Grant,
}

impl Principal {
    pub fn auth_mode(&self) -> AuthMode {
        match self.grant {
            Grant::ApiKey { .. } => AuthMode::ApiKey,
            Grant::OAuth { .. } => AuthMode::OAuth,
        }
    }

    /// The tenant an API key is bound to. Always `None` for OAuth callers.
    pub fn bound_tenant(&self) -> Option<&TenantId> {
        match &self.grant {
            Grant::ApiKey { tenant_id, .. } => Some(tenant_id),
            Grant::OAuth { .. } => None,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}
