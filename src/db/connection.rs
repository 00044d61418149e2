use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "scopegate".to_string()),
            database: env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "auth".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = [
        // Directory
        "DEFINE TABLE IF NOT EXISTS user SCHEMALESS;
         DEFINE INDEX IF NOT EXISTS user_email ON TABLE user COLUMNS email UNIQUE;",
        "DEFINE TABLE IF NOT EXISTS tenant SCHEMALESS;",
        "DEFINE TABLE IF NOT EXISTS tenant_member SCHEMALESS;
         DEFINE INDEX IF NOT EXISTS tenant_member_user ON TABLE tenant_member COLUMNS user_id;",
        // API keys, keyed by hash
        "DEFINE TABLE IF NOT EXISTS api_key SCHEMALESS;
         DEFINE INDEX IF NOT EXISTS api_key_prefix ON TABLE api_key COLUMNS key_prefix;
         DEFINE INDEX IF NOT EXISTS api_key_user ON TABLE api_key COLUMNS user_id;",
        // OAuth clients, codes and tokens
        "DEFINE TABLE IF NOT EXISTS oauth_client SCHEMALESS;",
        "DEFINE TABLE IF NOT EXISTS oauth_code SCHEMALESS;",
        "DEFINE TABLE IF NOT EXISTS oauth_token SCHEMALESS;
         DEFINE INDEX IF NOT EXISTS oauth_token_access ON TABLE oauth_token COLUMNS access_token_hash UNIQUE;
         DEFINE INDEX IF NOT EXISTS oauth_token_refresh ON TABLE oauth_token COLUMNS refresh_token_hash;",
        // Session scope rows used for restart recovery
        "DEFINE TABLE IF NOT EXISTS session_scope SCHEMALESS;
         DEFINE INDEX IF NOT EXISTS session_scope_user ON TABLE session_scope COLUMNS user_id, updated_at;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();
    }
}
