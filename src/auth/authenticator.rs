//! Unified bearer credential verification.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::auth::principal::{Grant, Principal};
use crate::auth::token::{hash_token, is_api_key};
use crate::cache::ConcurrentCache;
use crate::config::ServerConfig;
use crate::db::UserRecord;
use crate::store::{CredentialStore, Directory};
use crate::types::{TokenHash, UserId};

/// Verification errors.
///
/// Unknown, revoked and expired credentials all collapse into
/// `InvalidToken` so callers cannot tell them apart.
#[derive(Debug, Clone)]
pub enum AuthError {
    InvalidToken,
    /// The credential store could not be reached
    Store(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "Invalid or expired token"),
            Self::Store(msg) => write!(f, "Credential store error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Clone)]
enum CachedCredential {
    Valid(Principal),
    Invalid,
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    directory: Arc<dyn Directory>,
    cache: ConcurrentCache<TokenHash, CachedCredential>,
    negative_ttl: Duration,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        directory: Arc<dyn Directory>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            store,
            directory,
            cache: ConcurrentCache::with_ttl(
                config.credential_cache_capacity,
                Duration::from_secs(config.credential_cache_ttl_secs),
            ),
            negative_ttl: Duration::from_secs(config.negative_cache_ttl_secs),
        }
    }

    /// Verify a raw bearer credential.
    pub async fn verify(&self, raw: &str) -> Result<Principal, AuthError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        let hash = hash_token(raw);
        let now = chrono::Utc::now().timestamp();

        if let Some(cached) = self.cache.get(&hash) {
            return match cached {
                CachedCredential::Valid(principal) => {
                    // Expiry is re-checked on every hit.
                    if principal.is_expired(now) {
                        self.cache.invalidate(&hash);
                        return Err(AuthError::InvalidToken);
                    }
                    debug!(user_id = %principal.user_id, "credential cache hit");
                    self.record_use(&principal, hash, now);
                    Ok(principal)
                }
                CachedCredential::Invalid => Err(AuthError::InvalidToken),
            };
        }

        let looked_up = if is_api_key(raw) {
            self.lookup_api_key(&hash, now).await
        } else {
            self.lookup_access_token(&hash, now).await
        };

        match looked_up {
            Ok(Some(principal)) => {
                self.cache
                    .put(hash.clone(), CachedCredential::Valid(principal.clone()));
                self.record_use(&principal, hash, now);
                Ok(principal)
            }
            Ok(None) => {
                self.cache
                    .put_with_ttl(hash, CachedCredential::Invalid, self.negative_ttl);
                Err(AuthError::InvalidToken)
            }
            Err(e) => {
                error!("credential lookup failed: {:#}", e);
                Err(AuthError::Store(e.to_string()))
            }
        }
    }

    /// Drop any cached verification result for this credential hash.
    pub fn invalidate(&self, hash: &TokenHash) {
        if self.cache.invalidate(hash).is_some() {
            debug!("credential cache entry invalidated");
        }
    }

    /// Drop every cached principal of `user_id`; returns how many were removed.
    pub fn invalidate_user(&self, user_id: &UserId) -> usize {
        self.cache.retain(|_, cached| {
            !matches!(cached, CachedCredential::Valid(principal) if &principal.user_id == user_id)
        })
    }

    /// Deactivate a user. Their credentials stop verifying on the next
    /// request served by this process.
    pub async fn deactivate_user(&self, user_id: &UserId) -> anyhow::Result<bool> {
        let updated = self.directory.set_user_active(user_id, false).await?;
        let dropped = self.invalidate_user(user_id);
        if updated {
            info!(user_id = %user_id, dropped, "user deactivated");
        }
        Ok(updated)
    }

    async fn lookup_api_key(&self, hash: &TokenHash, now: i64) -> anyhow::Result<Option<Principal>> {
        let Some(key) = self.store.find_api_key(hash).await? else {
            return Ok(None);
        };
        if key.is_revoked() || key.is_expired(now) {
            warn!(key_prefix = %key.key_prefix, "rejected revoked or expired api key");
            return Ok(None);
        }
        let Some(user) = self.active_user(&key.user_id).await? else {
            return Ok(None);
        };

        Ok(Some(principal_for(
            user,
            key.scopes,
            key.expires_at,
            Grant::ApiKey {
                key_prefix: key.key_prefix,
                tenant_id: key.tenant_id,
            },
        )))
    }

    async fn lookup_access_token(
        &self,
        hash: &TokenHash,
        now: i64,
    ) -> anyhow::Result<Option<Principal>> {
        let Some(token) = self.store.find_token_by_access_hash(hash).await? else {
            return Ok(None);
        };
        if token.revoked || token.access_expires_at <= now {
            return Ok(None);
        }
        let Some(user) = self.active_user(&token.user_id).await? else {
            return Ok(None);
        };

        let scopes = token.scopes();
        Ok(Some(principal_for(
            user,
            scopes,
            Some(token.access_expires_at),
            Grant::OAuth {
                client_id: token.client_id,
            },
        )))
    }

    async fn active_user(&self, user_id: &UserId) -> anyhow::Result<Option<UserRecord>> {
        match self.directory.find_user(user_id).await? {
            Some(user) if user.is_active => Ok(Some(user)),
            Some(_) => {
                warn!(user_id = %user_id, "credential belongs to an inactive user");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // Fire-and-forget; never delays the response.
    fn record_use(&self, principal: &Principal, hash: TokenHash, now: i64) {
        if !matches!(principal.grant, Grant::ApiKey { .. }) {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_api_key(&hash, now).await {
                warn!("failed to record api key use: {:#}", e);
            }
        });
    }
}

fn principal_for(
    user: UserRecord,
    scopes: Vec<String>,
    expires_at: Option<i64>,
    grant: Grant,
) -> Principal {
    Principal {
        user_id: user.user_id,
        email: user.email,
        name: user.name,
        role: user.role,
        scopes,
        expires_at,
        grant,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::principal::AuthMode;
    use crate::auth::token::{generate_api_key, generate_oauth_token};
    use crate::db::store::tests::{new_user, setup_test_store};
    use crate::db::{
        ApiKeyRecord, AuthorizationCodeRecord, OAuthClientRecord, OAuthTokenRecord,
        SessionScopeRecord, SurrealStore,
    };
    use crate::types::{ApiKeyPrefix, ClientId, SessionId, TenantId};
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;

    /// Store whose every operation fails, as if the database were down.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl CredentialStore for FailingStore {
        async fn insert_api_key(&self, _: &ApiKeyRecord) -> Result<ApiKeyRecord> {
            Err(anyhow!("store unavailable"))
        }
        async fn find_api_key(&self, _: &TokenHash) -> Result<Option<ApiKeyRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn list_api_keys(&self, _: Option<&UserId>) -> Result<Vec<ApiKeyRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn revoke_api_keys_by_prefix(&self, _: &ApiKeyPrefix, _: i64) -> Result<Vec<TokenHash>> {
            Err(anyhow!("store unavailable"))
        }
        async fn touch_api_key(&self, _: &TokenHash, _: i64) -> Result<()> {
            Err(anyhow!("store unavailable"))
        }
        async fn insert_client(&self, _: &OAuthClientRecord) -> Result<()> {
            Err(anyhow!("store unavailable"))
        }
        async fn find_client(&self, _: &ClientId) -> Result<Option<OAuthClientRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn insert_authorization_code(&self, _: &AuthorizationCodeRecord) -> Result<()> {
            Err(anyhow!("store unavailable"))
        }
        async fn claim_authorization_code(
            &self,
            _: &TokenHash,
        ) -> Result<Option<AuthorizationCodeRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn insert_token(&self, _: &OAuthTokenRecord) -> Result<()> {
            Err(anyhow!("store unavailable"))
        }
        async fn find_token_by_access_hash(&self, _: &TokenHash) -> Result<Option<OAuthTokenRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn find_token_by_refresh_hash(&self, _: &TokenHash) -> Result<Option<OAuthTokenRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn revoke_token_by_refresh_hash(
            &self,
            _: &TokenHash,
        ) -> Result<Option<OAuthTokenRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn upsert_session_scope(&self, _: &SessionScopeRecord) -> Result<()> {
            Err(anyhow!("store unavailable"))
        }
        async fn find_session_scope(&self, _: &SessionId) -> Result<Option<SessionScopeRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn latest_session_scope_for_user(
            &self,
            _: &UserId,
        ) -> Result<Option<SessionScopeRecord>> {
            Err(anyhow!("store unavailable"))
        }
        async fn delete_session_scope(&self, _: &SessionId) -> Result<()> {
            Err(anyhow!("store unavailable"))
        }
    }

    pub(crate) fn test_config() -> ServerConfig {
        ServerConfig {
            base_url: "https://gate.example".to_string(),
            ..Default::default()
        }
    }

    fn authenticator(store: &SurrealStore) -> Authenticator {
        let store = Arc::new(store.clone());
        Authenticator::new(store.clone(), store, &test_config())
    }

    async fn insert_key(
        store: &SurrealStore,
        user_id: &UserId,
        expires_at: Option<i64>,
    ) -> (String, ApiKeyRecord) {
        let (full_key, prefix, key_hash) = generate_api_key();
        let record = ApiKeyRecord {
            key_hash,
            key_prefix: prefix,
            user_id: user_id.clone(),
            tenant_id: TenantId::new("t1"),
            name: Some("ci".to_string()),
            scopes: vec!["mcp:full".to_string()],
            expires_at,
            revoked_at: None,
            last_used_at: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        let record = store.insert_api_key(&record).await.unwrap();
        (full_key, record)
    }

    async fn insert_access_token(
        store: &SurrealStore,
        user_id: &UserId,
        access_expires_at: i64,
        revoked: bool,
    ) -> String {
        let access = generate_oauth_token();
        store
            .insert_token(&OAuthTokenRecord {
                access_token_hash: hash_token(&access),
                refresh_token_hash: None,
                client_id: ClientId::new("c1"),
                user_id: user_id.clone(),
                scope: "mcp:full".to_string(),
                access_expires_at,
                refresh_expires_at: None,
                revoked,
                created_at: chrono::Utc::now().timestamp(),
            })
            .await
            .unwrap();
        access
    }

    #[tokio::test]
    async fn test_verify_api_key() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let (key, _) = insert_key(&store, &user.user_id, None).await;
        let auth = authenticator(&store);

        let principal = auth.verify(&key).await.unwrap();
        assert_eq!(principal.auth_mode(), AuthMode::ApiKey);
        assert_eq!(principal.user_id, user.user_id);
        assert_eq!(principal.email, "a@example.com");
        assert_eq!(principal.bound_tenant(), Some(&TenantId::new("t1")));
    }

    #[tokio::test]
    async fn test_verify_records_last_used_asynchronously() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let (key, record) = insert_key(&store, &user.user_id, None).await;
        let auth = authenticator(&store);

        auth.verify(&key).await.unwrap();

        let mut last_used = None;
        for _ in 0..50 {
            let row = store.find_api_key(&record.key_hash).await.unwrap().unwrap();
            if row.last_used_at.is_some() {
                last_used = row.last_used_at;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(last_used.is_some());
    }

    #[tokio::test]
    async fn test_verify_oauth_token() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let now = chrono::Utc::now().timestamp();
        let token = insert_access_token(&store, &user.user_id, now + 3600, false).await;
        let auth = authenticator(&store);

        let principal = auth.verify(&token).await.unwrap();
        assert_eq!(principal.auth_mode(), AuthMode::OAuth);
        assert!(principal.bound_tenant().is_none());
        assert_eq!(principal.scopes, vec!["mcp:full".to_string()]);
    }

    #[tokio::test]
    async fn test_failures_are_indistinguishable() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let now = chrono::Utc::now().timestamp();
        let expired = insert_access_token(&store, &user.user_id, now - 1, false).await;
        let revoked = insert_access_token(&store, &user.user_id, now + 3600, true).await;
        let (expired_key, _) = insert_key(&store, &user.user_id, Some(now - 10)).await;
        let auth = authenticator(&store);

        for raw in [
            expired.as_str(),
            revoked.as_str(),
            expired_key.as_str(),
            "unknown-token",
            "sgk_unknown",
            "",
        ] {
            let err = auth.verify(raw).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidToken), "{raw}");
        }
    }

    #[tokio::test]
    async fn test_inactive_user_is_rejected() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let (key, _) = insert_key(&store, &user.user_id, None).await;
        store.set_user_active(&user.user_id, false).await.unwrap();
        let auth = authenticator(&store);

        assert!(matches!(auth.verify(&key).await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_cached_entry_trusted_until_invalidated() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let (key, record) = insert_key(&store, &user.user_id, None).await;
        let auth = authenticator(&store);

        auth.verify(&key).await.unwrap();
        // Revoked in the store without telling the authenticator: the cached
        // entry is still trusted until invalidated.
        store
            .revoke_api_keys_by_prefix(&record.key_prefix, chrono::Utc::now().timestamp())
            .await
            .unwrap();
        assert!(auth.verify(&key).await.is_ok());

        auth.invalidate(&record.key_hash);
        assert!(matches!(auth.verify(&key).await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_deactivation_drops_cached_principals() {
        let store = setup_test_store().await;
        let alice = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let bob = store.create_user(new_user("b@example.com", "pw")).await.unwrap();
        let (alice_key, _) = insert_key(&store, &alice.user_id, None).await;
        let (bob_key, _) = insert_key(&store, &bob.user_id, None).await;
        let auth = authenticator(&store);

        auth.verify(&alice_key).await.unwrap();
        auth.verify(&bob_key).await.unwrap();

        assert!(auth.deactivate_user(&alice.user_id).await.unwrap());
        assert!(matches!(auth.verify(&alice_key).await, Err(AuthError::InvalidToken)));
        assert!(auth.verify(&bob_key).await.is_ok());

        // Unknown users are reported, not created.
        assert!(!auth.deactivate_user(&UserId::new("ghost")).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_user_spares_negative_entries() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let (key, _) = insert_key(&store, &user.user_id, None).await;
        let auth = authenticator(&store);

        auth.verify(&key).await.unwrap();
        assert!(auth.verify("unknown-token").await.is_err());
        assert_eq!(auth.invalidate_user(&user.user_id), 1);
        assert_eq!(auth.invalidate_user(&user.user_id), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_a_server_error() {
        let store = setup_test_store().await;
        let auth = Authenticator::new(Arc::new(FailingStore), Arc::new(store), &test_config());

        let err = auth.verify("some-opaque-token").await.unwrap_err();
        assert!(matches!(err, AuthError::Store(_)));

        let err = auth.verify("sgk_somekey").await.unwrap_err();
        assert!(matches!(err, AuthError::Store(_)));
    }
}
