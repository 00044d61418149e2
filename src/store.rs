//! Collaborator seams consumed by the auth core.
//!
//! `CredentialStore` persists auth records and holds no business logic.
//! `Directory` answers questions about users and tenants. Both are injected
//! as trait objects so tests can substitute failing or in-memory variants.

use anyhow::Result;
use async_trait::async_trait;

use crate::db::{
    ApiKeyRecord, AuthorizationCodeRecord, OAuthClientRecord, OAuthTokenRecord,
    SessionScopeRecord, TenantRecord, UserRecord,
};
use crate::types::{ApiKeyPrefix, ClientId, SessionId, TenantId, TokenHash, UserId};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_api_key(&self, key: &ApiKeyRecord) -> Result<ApiKeyRecord>;
    async fn find_api_key(&self, key_hash: &TokenHash) -> Result<Option<ApiKeyRecord>>;
    async fn list_api_keys(&self, user_id: Option<&UserId>) -> Result<Vec<ApiKeyRecord>>;
    /// Marks matching live keys revoked and returns their hashes.
    async fn revoke_api_keys_by_prefix(
        &self,
        key_prefix: &ApiKeyPrefix,
        revoked_at: i64,
    ) -> Result<Vec<TokenHash>>;
    async fn touch_api_key(&self, key_hash: &TokenHash, used_at: i64) -> Result<()>;

    async fn insert_client(&self, client: &OAuthClientRecord) -> Result<()>;
    async fn find_client(&self, client_id: &ClientId) -> Result<Option<OAuthClientRecord>>;

    async fn insert_authorization_code(&self, code: &AuthorizationCodeRecord) -> Result<()>;
    /// Consumes the code. Returns `None` if it is unknown or already used.
    async fn claim_authorization_code(
        &self,
        code_hash: &TokenHash,
    ) -> Result<Option<AuthorizationCodeRecord>>;

    async fn insert_token(&self, token: &OAuthTokenRecord) -> Result<()>;
    async fn find_token_by_access_hash(
        &self,
        access_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>>;
    async fn find_token_by_refresh_hash(
        &self,
        refresh_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>>;
    /// Revokes the live row for this refresh token. Returns `None` when the
    /// row is unknown or was already revoked by a concurrent caller.
    async fn revoke_token_by_refresh_hash(
        &self,
        refresh_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>>;

    async fn upsert_session_scope(&self, scope: &SessionScopeRecord) -> Result<()>;
    async fn find_session_scope(&self, session_id: &SessionId)
    -> Result<Option<SessionScopeRecord>>;
    async fn latest_session_scope_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<SessionScopeRecord>>;
    async fn delete_session_scope(&self, session_id: &SessionId) -> Result<()>;
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_user(&self, user_id: &UserId) -> Result<Option<UserRecord>>;
    /// Returns the user when the email/password pair is valid, regardless of
    /// whether the account is active.
    async fn verify_credentials(&self, email: &str, password: &str) -> Result<Option<UserRecord>>;
    async fn find_tenant(&self, tenant_id: &TenantId) -> Result<Option<TenantRecord>>;
    async fn list_tenants_for_user(&self, user_id: &UserId) -> Result<Vec<TenantRecord>>;
    async fn is_member(&self, user_id: &UserId, tenant_id: &TenantId) -> Result<bool>;
    /// Returns false when the user does not exist.
    async fn set_user_active(&self, user_id: &UserId, active: bool) -> Result<bool>;
}
