//! SurrealDB-backed credential store and directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::db::Db;
use crate::db::queries::QueryBuilder;
use crate::db::schema::*;
use crate::store::{CredentialStore, Directory};
use crate::types::{ApiKeyPrefix, ClientId, SessionId, TenantId, TokenHash, UserId};

/// Input for creating a user account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub password: String,
}

/// Store backed by a SurrealDB connection.
#[derive(Clone)]
pub struct SurrealStore {
    db: Db,
    password_cost: u32,
}

impl SurrealStore {
    /// Create a new store using the default bcrypt cost for new passwords.
    pub fn new(db: Db) -> Self {
        Self {
            db,
            password_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Override the bcrypt cost used when hashing new passwords.
    pub fn with_password_cost(mut self, cost: u32) -> Self {
        self.password_cost = cost;
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn create_user(&self, user: NewUser) -> Result<UserRecord> {
        let email = user.email.trim().to_lowercase();
        if QueryBuilder::find_user_by_email(&self.db, &email).await?.is_some() {
            anyhow::bail!("a user with email {} already exists", email);
        }

        let password = user.password;
        let cost = self.password_cost;
        let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .context("password hashing task failed")??;

        let record = UserRecord {
            user_id: UserId::new(Uuid::new_v4().to_string()),
            email,
            name: user.name,
            role: user.role,
            password_hash,
            is_active: true,
            created_at: chrono::Utc::now().timestamp(),
        };
        QueryBuilder::create_user(&self.db, &record).await
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        QueryBuilder::find_user_by_email(&self.db, &email.trim().to_lowercase()).await
    }

    pub async fn set_user_active(&self, user_id: &UserId, active: bool) -> Result<bool> {
        QueryBuilder::set_user_active(&self.db, user_id, active).await
    }

    pub async fn create_tenant(&self, name: &str) -> Result<TenantRecord> {
        let record = TenantRecord {
            tenant_id: TenantId::new(Uuid::new_v4().to_string()),
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        QueryBuilder::create_tenant(&self.db, &record).await
    }

    pub async fn delete_tenant(&self, tenant_id: &TenantId) -> Result<()> {
        QueryBuilder::delete_tenant(&self.db, tenant_id).await
    }

    pub async fn add_member(&self, user_id: &UserId, tenant_id: &TenantId, role: &str) -> Result<()> {
        let membership = MembershipRecord {
            user_id: user_id.clone(),
            tenant_id: tenant_id.clone(),
            role: role.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        QueryBuilder::add_member(&self.db, &membership).await
    }

    pub async fn remove_member(&self, user_id: &UserId, tenant_id: &TenantId) -> Result<()> {
        QueryBuilder::remove_member(&self.db, user_id, tenant_id).await
    }
}

#[async_trait]
impl CredentialStore for SurrealStore {
    async fn insert_api_key(&self, key: &ApiKeyRecord) -> Result<ApiKeyRecord> {
        QueryBuilder::create_api_key(&self.db, key).await
    }

    async fn find_api_key(&self, key_hash: &TokenHash) -> Result<Option<ApiKeyRecord>> {
        QueryBuilder::find_api_key_by_hash(&self.db, key_hash).await
    }

    async fn list_api_keys(&self, user_id: Option<&UserId>) -> Result<Vec<ApiKeyRecord>> {
        QueryBuilder::list_api_keys(&self.db, user_id).await
    }

    async fn revoke_api_keys_by_prefix(
        &self,
        key_prefix: &ApiKeyPrefix,
        revoked_at: i64,
    ) -> Result<Vec<TokenHash>> {
        QueryBuilder::revoke_api_keys_by_prefix(&self.db, key_prefix, revoked_at).await
    }

    async fn touch_api_key(&self, key_hash: &TokenHash, used_at: i64) -> Result<()> {
        QueryBuilder::update_api_key_last_used(&self.db, key_hash, used_at).await
    }

    async fn insert_client(&self, client: &OAuthClientRecord) -> Result<()> {
        QueryBuilder::create_client(&self.db, client).await
    }

    async fn find_client(&self, client_id: &ClientId) -> Result<Option<OAuthClientRecord>> {
        QueryBuilder::find_client(&self.db, client_id).await
    }

    async fn insert_authorization_code(&self, code: &AuthorizationCodeRecord) -> Result<()> {
        QueryBuilder::create_authorization_code(&self.db, code).await
    }

    async fn claim_authorization_code(
        &self,
        code_hash: &TokenHash,
    ) -> Result<Option<AuthorizationCodeRecord>> {
        QueryBuilder::claim_authorization_code(&self.db, code_hash).await
    }

    async fn insert_token(&self, token: &OAuthTokenRecord) -> Result<()> {
        QueryBuilder::create_token(&self.db, token).await
    }

    async fn find_token_by_access_hash(
        &self,
        access_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>> {
        QueryBuilder::find_token_by_access_hash(&self.db, access_hash).await
    }

    async fn find_token_by_refresh_hash(
        &self,
        refresh_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>> {
        QueryBuilder::find_token_by_refresh_hash(&self.db, refresh_hash).await
    }

    async fn revoke_token_by_refresh_hash(
        &self,
        refresh_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>> {
        QueryBuilder::revoke_token_by_refresh_hash(&self.db, refresh_hash).await
    }

    async fn upsert_session_scope(&self, scope: &SessionScopeRecord) -> Result<()> {
        QueryBuilder::upsert_session_scope(&self.db, scope).await
    }

    async fn find_session_scope(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionScopeRecord>> {
        QueryBuilder::find_session_scope(&self.db, session_id).await
    }

    async fn latest_session_scope_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<SessionScopeRecord>> {
        QueryBuilder::latest_session_scope_for_user(&self.db, user_id).await
    }

    async fn delete_session_scope(&self, session_id: &SessionId) -> Result<()> {
        QueryBuilder::delete_session_scope(&self.db, session_id).await
    }
}

#[async_trait]
impl Directory for SurrealStore {
    async fn find_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        QueryBuilder::find_user(&self.db, user_id).await
    }

    async fn verify_credentials(&self, email: &str, password: &str) -> Result<Option<UserRecord>> {
        let Some(user) = self.find_user_by_email(email).await? else {
            return Ok(None);
        };

        let password = password.to_string();
        let hash = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .context("password verification task failed")?
            .unwrap_or(false);

        Ok(valid.then_some(user))
    }

    async fn find_tenant(&self, tenant_id: &TenantId) -> Result<Option<TenantRecord>> {
        QueryBuilder::find_tenant(&self.db, tenant_id).await
    }

    async fn list_tenants_for_user(&self, user_id: &UserId) -> Result<Vec<TenantRecord>> {
        QueryBuilder::list_tenants_for_user(&self.db, user_id).await
    }

    async fn is_member(&self, user_id: &UserId, tenant_id: &TenantId) -> Result<bool> {
        Ok(QueryBuilder::find_membership(&self.db, user_id, tenant_id)
            .await?
            .is_some())
    }

    async fn set_user_active(&self, user_id: &UserId, active: bool) -> Result<bool> {
        QueryBuilder::set_user_active(&self.db, user_id, active).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, create_connection, ensure_schema};

    pub(crate) async fn setup_test_store() -> SurrealStore {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        SurrealStore::new(db).with_password_cost(4)
    }

    pub(crate) fn new_user(email: &str, password: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            name: Some("Test User".to_string()),
            role: "member".to_string(),
            password: password.to_string(),
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn code(hash: &str) -> AuthorizationCodeRecord {
        AuthorizationCodeRecord {
            code_hash: TokenHash::new(hash),
            client_id: ClientId::new("client-1"),
            user_id: UserId::new("user-1"),
            redirect_uri: "https://app.example/cb".to_string(),
            scope: "mcp:full".to_string(),
            code_challenge: Some("challenge".to_string()),
            code_challenge_method: Some("S256".to_string()),
            expires_at: now() + 600,
            used: false,
            created_at: now(),
        }
    }

    fn token(access: &str, refresh: &str) -> OAuthTokenRecord {
        OAuthTokenRecord {
            access_token_hash: TokenHash::new(access),
            refresh_token_hash: Some(TokenHash::new(refresh)),
            client_id: ClientId::new("client-1"),
            user_id: UserId::new("user-1"),
            scope: "mcp:full".to_string(),
            access_expires_at: now() + 3600,
            refresh_expires_at: Some(now() + 86400),
            revoked: false,
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn test_verify_credentials() {
        let store = setup_test_store().await;
        store
            .create_user(new_user("Alice@Example.com", "hunter22"))
            .await
            .unwrap();

        let ok = store
            .verify_credentials("alice@example.com", "hunter22")
            .await
            .unwrap();
        assert!(ok.is_some());

        let bad = store
            .verify_credentials("alice@example.com", "wrong")
            .await
            .unwrap();
        assert!(bad.is_none());

        let unknown = store
            .verify_credentials("bob@example.com", "hunter22")
            .await
            .unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = setup_test_store().await;
        store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        assert!(store.create_user(new_user("a@example.com", "pw")).await.is_err());
    }

    #[tokio::test]
    async fn test_membership_and_tenant_listing() {
        let store = setup_test_store().await;
        let user = store.create_user(new_user("a@example.com", "pw")).await.unwrap();
        let acme = store.create_tenant("Acme").await.unwrap();
        let globex = store.create_tenant("Globex").await.unwrap();
        store.add_member(&user.user_id, &acme.tenant_id, "member").await.unwrap();

        assert!(store.is_member(&user.user_id, &acme.tenant_id).await.unwrap());
        assert!(!store.is_member(&user.user_id, &globex.tenant_id).await.unwrap());

        let tenants = store.list_tenants_for_user(&user.user_id).await.unwrap();
        assert_eq!(tenants, vec![acme.clone()]);

        store.remove_member(&user.user_id, &acme.tenant_id).await.unwrap();
        assert!(!store.is_member(&user.user_id, &acme.tenant_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_authorization_code_claimed_once() {
        let store = setup_test_store().await;
        store.insert_authorization_code(&code("abc")).await.unwrap();

        let first = store
            .claim_authorization_code(&TokenHash::new("abc"))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(!first.unwrap().used);

        let second = store
            .claim_authorization_code(&TokenHash::new("abc"))
            .await
            .unwrap();
        assert!(second.is_none());

        let unknown = store
            .claim_authorization_code(&TokenHash::new("nope"))
            .await
            .unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn test_refresh_revocation_is_single_winner() {
        let store = setup_test_store().await;
        store.insert_token(&token("acc", "ref")).await.unwrap();

        let found = store
            .find_token_by_access_hash(&TokenHash::new("acc"))
            .await
            .unwrap();
        assert!(found.is_some());

        let revoked = store
            .revoke_token_by_refresh_hash(&TokenHash::new("ref"))
            .await
            .unwrap();
        assert!(revoked.is_some());
        assert!(!revoked.unwrap().revoked);

        let again = store
            .revoke_token_by_refresh_hash(&TokenHash::new("ref"))
            .await
            .unwrap();
        assert!(again.is_none());

        let row = store
            .find_token_by_refresh_hash(&TokenHash::new("ref"))
            .await
            .unwrap()
            .unwrap();
        assert!(row.revoked);
    }

    #[tokio::test]
    async fn test_session_scope_roundtrip_and_latest() {
        let store = setup_test_store().await;
        let user = UserId::new("user-1");

        store
            .upsert_session_scope(&SessionScopeRecord {
                session_id: SessionId::new("s1"),
                user_id: user.clone(),
                tenant_id: Some(TenantId::new("t1")),
                updated_at: 100,
            })
            .await
            .unwrap();
        store
            .upsert_session_scope(&SessionScopeRecord {
                session_id: SessionId::new("s2"),
                user_id: user.clone(),
                tenant_id: Some(TenantId::new("t2")),
                updated_at: 200,
            })
            .await
            .unwrap();

        let s1 = store
            .find_session_scope(&SessionId::new("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s1.tenant_id, Some(TenantId::new("t1")));

        let latest = store.latest_session_scope_for_user(&user).await.unwrap().unwrap();
        assert_eq!(latest.session_id, SessionId::new("s2"));

        store.delete_session_scope(&SessionId::new("s2")).await.unwrap();
        assert!(
            store
                .find_session_scope(&SessionId::new("s2"))
                .await
                .unwrap()
                .is_none()
        );
        let latest = store.latest_session_scope_for_user(&user).await.unwrap().unwrap();
        assert_eq!(latest.session_id, SessionId::new("s1"));
    }
}
