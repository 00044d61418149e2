//! API key lifecycle: create, list, revoke.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::info;

use crate::auth::authenticator::Authenticator;
use crate::auth::token::generate_api_key;
use crate::config::DEFAULT_SCOPE;
use crate::db::ApiKeyRecord;
use crate::store::{CredentialStore, Directory};
use crate::types::{ApiKeyPrefix, TenantId, UserId};

/// Request to mint a key.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub name: Option<String>,
    /// Defaults to the standard tool scope when empty.
    pub scopes: Vec<String>,
    pub expires_in_days: Option<i64>,
}

/// A freshly minted key. `key` is the only copy of the secret.
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub key: String,
    pub record: ApiKeyRecord,
}

pub struct ApiKeyManager {
    store: Arc<dyn CredentialStore>,
    directory: Arc<dyn Directory>,
    authenticator: Arc<Authenticator>,
}

impl ApiKeyManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        directory: Arc<dyn Directory>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        Self {
            store,
            directory,
            authenticator,
        }
    }

    pub async fn create(&self, request: NewApiKey) -> Result<CreatedApiKey> {
        if self.directory.find_user(&request.user_id).await?.is_none() {
            bail!("unknown user {}", request.user_id);
        }
        if self.directory.find_tenant(&request.tenant_id).await?.is_none() {
            bail!("unknown tenant {}", request.tenant_id);
        }
        if !self
            .directory
            .is_member(&request.user_id, &request.tenant_id)
            .await?
        {
            bail!(
                "user {} is not a member of tenant {}",
                request.user_id,
                request.tenant_id
            );
        }

        let (key, key_prefix, key_hash) = generate_api_key();
        let now = chrono::Utc::now().timestamp();
        let scopes = if request.scopes.is_empty() {
            vec![DEFAULT_SCOPE.to_string()]
        } else {
            request.scopes
        };

        let record = ApiKeyRecord {
            key_hash,
            key_prefix,
            user_id: request.user_id,
            tenant_id: request.tenant_id,
            name: request.name,
            scopes,
            expires_at: request.expires_in_days.map(|days| now + days * 24 * 3600),
            revoked_at: None,
            last_used_at: None,
            created_at: now,
        };
        let record = self.store.insert_api_key(&record).await?;
        info!(key_prefix = %record.key_prefix, user_id = %record.user_id, "api key created");

        Ok(CreatedApiKey { key, record })
    }

    pub async fn list(&self, user_id: Option<&UserId>) -> Result<Vec<ApiKeyRecord>> {
        self.store.list_api_keys(user_id).await
    }

    /// Revoke by display prefix. Cached verifications are dropped before
    /// this returns, so the key stops working immediately.
    pub async fn revoke(&self, key_prefix: &ApiKeyPrefix) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let revoked = self.store.revoke_api_keys_by_prefix(key_prefix, now).await?;
        for hash in &revoked {
            self.authenticator.invalidate(hash);
        }
        if !revoked.is_empty() {
            info!(key_prefix = %key_prefix, "api key revoked");
        }
        Ok(!revoked.is_empty())
    }
}
