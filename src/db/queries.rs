// Database query helpers for SurrealDB.
//
// Every credential row is keyed by the digest it is looked up with, so
// single-record statements (`type::thing(...)`) are used wherever possible.
// Conditional UPDATEs with `RETURN BEFORE` give the one-shot semantics the
// code and refresh-token flows need without a separate transaction.

use crate::db::Db;
use crate::db::schema::*;
use crate::types::{ApiKeyPrefix, ClientId, SessionId, TenantId, TokenHash, UserId};
use anyhow::{Result, anyhow};

pub struct QueryBuilder;

fn membership_key(user_id: &UserId, tenant_id: &TenantId) -> String {
    format!("{}/{}", user_id, tenant_id)
}

impl QueryBuilder {
    // ----- users & tenants -------------------------------------------------

    pub async fn create_user(db: &Db, user: &UserRecord) -> Result<UserRecord> {
        let mut res = db
            .query("CREATE type::thing('user', $id) CONTENT $data")
            .bind(("id", user.user_id.as_str().to_string()))
            .bind(("data", user.clone()))
            .await?;

        let created: Option<UserRecord> = res.take(0)?;
        created.ok_or_else(|| anyhow!("failed to create user record"))
    }

    pub async fn find_user(db: &Db, user_id: &UserId) -> Result<Option<UserRecord>> {
        let mut res = db
            .query("SELECT * FROM type::thing('user', $id)")
            .bind(("id", user_id.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn find_user_by_email(db: &Db, email: &str) -> Result<Option<UserRecord>> {
        let mut res = db
            .query("SELECT * FROM user WHERE email = $email LIMIT 1")
            .bind(("email", email.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn set_user_active(db: &Db, user_id: &UserId, active: bool) -> Result<bool> {
        let mut res = db
            .query("UPDATE type::thing('user', $id) SET is_active = $active RETURN AFTER")
            .bind(("id", user_id.as_str().to_string()))
            .bind(("active", active))
            .await?;
        let updated: Option<UserRecord> = res.take(0)?;
        Ok(updated.is_some())
    }

    pub async fn create_tenant(db: &Db, tenant: &TenantRecord) -> Result<TenantRecord> {
        let mut res = db
            .query("CREATE type::thing('tenant', $id) CONTENT $data")
            .bind(("id", tenant.tenant_id.as_str().to_string()))
            .bind(("data", tenant.clone()))
            .await?;

        let created: Option<TenantRecord> = res.take(0)?;
        created.ok_or_else(|| anyhow!("failed to create tenant record"))
    }

    pub async fn find_tenant(db: &Db, tenant_id: &TenantId) -> Result<Option<TenantRecord>> {
        let mut res = db
            .query("SELECT * FROM type::thing('tenant', $id)")
            .bind(("id", tenant_id.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn delete_tenant(db: &Db, tenant_id: &TenantId) -> Result<()> {
        db.query(
            "DELETE type::thing('tenant', $id);
             DELETE tenant_member WHERE tenant_id = $id;",
        )
        .bind(("id", tenant_id.as_str().to_string()))
        .await?
        .check()?;
        Ok(())
    }

    pub async fn add_member(db: &Db, membership: &MembershipRecord) -> Result<()> {
        db.query("UPSERT type::thing('tenant_member', $key) CONTENT $data")
            .bind((
                "key",
                membership_key(&membership.user_id, &membership.tenant_id),
            ))
            .bind(("data", membership.clone()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn remove_member(db: &Db, user_id: &UserId, tenant_id: &TenantId) -> Result<()> {
        db.query("DELETE type::thing('tenant_member', $key)")
            .bind(("key", membership_key(user_id, tenant_id)))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn find_membership(
        db: &Db,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Option<MembershipRecord>> {
        let mut res = db
            .query("SELECT * FROM type::thing('tenant_member', $key)")
            .bind(("key", membership_key(user_id, tenant_id)))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn list_tenants_for_user(db: &Db, user_id: &UserId) -> Result<Vec<TenantRecord>> {
        let mut res = db
            .query(
                r#"
                SELECT * FROM tenant
                WHERE tenant_id IN (SELECT VALUE tenant_id FROM tenant_member WHERE user_id = $user_id)
                ORDER BY name ASC
                "#,
            )
            .bind(("user_id", user_id.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    // ----- API keys --------------------------------------------------------

    pub async fn create_api_key(db: &Db, key: &ApiKeyRecord) -> Result<ApiKeyRecord> {
        let mut res = db
            .query("CREATE type::thing('api_key', $hash) CONTENT $data")
            .bind(("hash", key.key_hash.as_str().to_string()))
            .bind(("data", key.clone()))
            .await?;

        let created: Option<ApiKeyRecord> = res.take(0)?;
        created.ok_or_else(|| anyhow!("failed to create api key record"))
    }

    pub async fn find_api_key_by_hash(db: &Db, key_hash: &TokenHash) -> Result<Option<ApiKeyRecord>> {
        let mut res = db
            .query("SELECT * FROM type::thing('api_key', $hash)")
            .bind(("hash", key_hash.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn list_api_keys(db: &Db, user_id: Option<&UserId>) -> Result<Vec<ApiKeyRecord>> {
        let mut res = match user_id {
            Some(user_id) => {
                db.query("SELECT * FROM api_key WHERE user_id = $user_id ORDER BY created_at DESC")
                    .bind(("user_id", user_id.as_str().to_string()))
                    .await?
            }
            None => db.query("SELECT * FROM api_key ORDER BY created_at DESC").await?,
        };
        Ok(res.take(0)?)
    }

    /// Revoke every live key with the given display prefix and return the
    /// hashes that were revoked.
    pub async fn revoke_api_keys_by_prefix(
        db: &Db,
        key_prefix: &ApiKeyPrefix,
        revoked_at: i64,
    ) -> Result<Vec<TokenHash>> {
        let mut res = db
            .query(
                r#"
                UPDATE api_key SET revoked_at = $now
                WHERE key_prefix = $prefix AND (revoked_at = NONE OR revoked_at = NULL)
                RETURN AFTER
                "#,
            )
            .bind(("prefix", key_prefix.as_str().to_string()))
            .bind(("now", revoked_at))
            .await?;

        let revoked: Vec<ApiKeyRecord> = res.take(0)?;
        Ok(revoked.into_iter().map(|k| k.key_hash).collect())
    }

    pub async fn update_api_key_last_used(db: &Db, key_hash: &TokenHash, used_at: i64) -> Result<()> {
        db.query("UPDATE type::thing('api_key', $hash) SET last_used_at = $now")
            .bind(("hash", key_hash.as_str().to_string()))
            .bind(("now", used_at))
            .await?
            .check()?;
        Ok(())
    }

    // ----- OAuth clients, codes, tokens ------------------------------------

    pub async fn create_client(db: &Db, client: &OAuthClientRecord) -> Result<()> {
        db.query("CREATE type::thing('oauth_client', $id) CONTENT $data")
            .bind(("id", client.client_id.as_str().to_string()))
            .bind(("data", client.clone()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn find_client(db: &Db, client_id: &ClientId) -> Result<Option<OAuthClientRecord>> {
        let mut res = db
            .query("SELECT * FROM type::thing('oauth_client', $id)")
            .bind(("id", client_id.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn create_authorization_code(db: &Db, code: &AuthorizationCodeRecord) -> Result<()> {
        db.query("CREATE type::thing('oauth_code', $hash) CONTENT $data")
            .bind(("hash", code.code_hash.as_str().to_string()))
            .bind(("data", code.clone()))
            .await?
            .check()?;
        Ok(())
    }

    /// Atomically mark an unused code as used, returning the row as it was
    /// before the update. `None` means unknown or already consumed.
    pub async fn claim_authorization_code(
        db: &Db,
        code_hash: &TokenHash,
    ) -> Result<Option<AuthorizationCodeRecord>> {
        let mut res = db
            .query(
                "UPDATE type::thing('oauth_code', $hash) SET used = true WHERE used = false RETURN BEFORE",
            )
            .bind(("hash", code_hash.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn create_token(db: &Db, token: &OAuthTokenRecord) -> Result<()> {
        db.query("CREATE oauth_token CONTENT $data")
            .bind(("data", token.clone()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn find_token_by_access_hash(
        db: &Db,
        access_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>> {
        let mut res = db
            .query("SELECT * FROM oauth_token WHERE access_token_hash = $hash LIMIT 1")
            .bind(("hash", access_hash.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn find_token_by_refresh_hash(
        db: &Db,
        refresh_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>> {
        let mut res = db
            .query("SELECT * FROM oauth_token WHERE refresh_token_hash = $hash LIMIT 1")
            .bind(("hash", refresh_hash.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    /// Atomically revoke the live row holding this refresh token. Only one of
    /// several concurrent callers gets the row back.
    pub async fn revoke_token_by_refresh_hash(
        db: &Db,
        refresh_hash: &TokenHash,
    ) -> Result<Option<OAuthTokenRecord>> {
        let mut res = db
            .query(
                r#"
                UPDATE oauth_token SET revoked = true
                WHERE refresh_token_hash = $hash AND revoked = false
                RETURN BEFORE
                "#,
            )
            .bind(("hash", refresh_hash.as_str().to_string()))
            .await?;
        let rows: Vec<OAuthTokenRecord> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    // ----- session scopes --------------------------------------------------

    pub async fn upsert_session_scope(db: &Db, scope: &SessionScopeRecord) -> Result<()> {
        db.query("UPSERT type::thing('session_scope', $id) CONTENT $data")
            .bind(("id", scope.session_id.as_str().to_string()))
            .bind(("data", scope.clone()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn find_session_scope(
        db: &Db,
        session_id: &SessionId,
    ) -> Result<Option<SessionScopeRecord>> {
        let mut res = db
            .query("SELECT * FROM type::thing('session_scope', $id)")
            .bind(("id", session_id.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn latest_session_scope_for_user(
        db: &Db,
        user_id: &UserId,
    ) -> Result<Option<SessionScopeRecord>> {
        let mut res = db
            .query(
                r#"
                SELECT * FROM session_scope
                WHERE user_id = $user_id AND tenant_id != NONE AND tenant_id != NULL
                ORDER BY updated_at DESC
                LIMIT 1
                "#,
            )
            .bind(("user_id", user_id.as_str().to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn delete_session_scope(db: &Db, session_id: &SessionId) -> Result<()> {
        db.query("DELETE type::thing('session_scope', $id)")
            .bind(("id", session_id.as_str().to_string()))
            .await?
            .check()?;
        Ok(())
    }
}
