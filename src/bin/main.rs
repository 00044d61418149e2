use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use scopegate::{
    AppState, DatabaseConfig, NewApiKey, NewUser, ServerConfig, SurrealStore, TenantId, UserId,
    create_connection, ensure_schema,
};
use scopegate::types::ApiKeyPrefix;

#[derive(Parser)]
#[command(name = "scopegate")]
#[command(about = "OAuth 2.1 authorization server and tenant-scoping gateway for MCP tools")]
struct Cli {
    /// SurrealDB endpoint ("memory" for an ephemeral store)
    #[arg(long, global = true, env = "SURREALDB_URL", default_value = "memory")]
    db_url: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the authorization server and the /mcp gateway
    Serve {
        /// Bind address, e.g. 0.0.0.0:3942
        #[arg(long, env = "SCOPEGATE_BIND")]
        bind: Option<String>,
        /// Externally reachable base URL, used as the OAuth issuer
        #[arg(long, env = "SCOPEGATE_BASE_URL")]
        base_url: Option<String>,
    },
    /// Initialize the database schema
    Init,
    /// Create a user who can sign in at /authorize
    CreateUser {
        email: String,
        #[arg(long, env = "SCOPEGATE_USER_PASSWORD")]
        password: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "member")]
        role: String,
    },
    /// Deactivate a user; their credentials stop verifying
    DeactivateUser { email: String },
    /// Create a tenant
    CreateTenant { name: String },
    /// Add a user to a tenant
    AddMember {
        email: String,
        tenant_id: String,
        #[arg(long, default_value = "member")]
        role: String,
    },
    /// Create a new API key bound to one tenant
    CreateApiKey {
        /// Email of the owning user
        email: String,
        tenant_id: String,
        /// Human-readable name for this key
        #[arg(long)]
        name: Option<String>,
        /// Number of days until the key expires (omit for no expiration)
        #[arg(long)]
        expires_days: Option<u32>,
        /// Comma-separated list of scopes for this key
        #[arg(long)]
        scopes: Option<String>,
    },
    /// List API keys
    ListApiKeys {
        /// Only keys owned by this user
        #[arg(long)]
        email: Option<String>,
        /// Show only active keys
        #[arg(long, default_value_t = false)]
        active_only: bool,
    },
    /// Revoke an API key by its prefix
    RevokeApiKey {
        /// The key prefix to revoke (e.g., "sgk_abc12345")
        key_prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("scopegate=info".parse()?)
                .add_directive("surrealdb=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let store = open_store(&cli.db_url).await?;

    match cli.command {
        Commands::Serve { bind, base_url } => {
            let mut config = ServerConfig::default();
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(base_url) = base_url {
                config.base_url = base_url;
            }
            if cli.db_url == "memory" {
                info!("using an in-memory database; state is lost on exit");
            }
            scopegate::serve(AppState::new(config, store)).await?;
        }
        Commands::Init => {
            info!("Database initialized successfully");
        }
        Commands::CreateUser {
            email,
            password,
            name,
            role,
        } => {
            let user = store
                .create_user(NewUser {
                    email,
                    name,
                    role,
                    password,
                })
                .await?;
            println!("User created: {} ({})", user.email, user.user_id);
        }
        Commands::DeactivateUser { email } => {
            let user_id = user_id_for(&store, &email).await?;
            let state = AppState::new(ServerConfig::default(), store);
            if state.authenticator.deactivate_user(&user_id).await? {
                println!("User {} has been deactivated.", email);
            } else {
                println!("No user found for {}.", email);
            }
        }
        Commands::CreateTenant { name } => {
            let tenant = store.create_tenant(&name).await?;
            println!("Tenant created: {} ({})", tenant.name, tenant.tenant_id);
        }
        Commands::AddMember {
            email,
            tenant_id,
            role,
        } => {
            let user_id = user_id_for(&store, &email).await?;
            let tenant_id = TenantId::new(tenant_id);
            store.add_member(&user_id, &tenant_id, &role).await?;
            println!("{} is now a {} of tenant {}", email, role, tenant_id);
        }
        Commands::CreateApiKey {
            email,
            tenant_id,
            name,
            expires_days,
            scopes,
        } => {
            let user_id = user_id_for(&store, &email).await?;
            let state = AppState::new(ServerConfig::default(), store);

            let scopes = scopes
                .map(|s| {
                    s.split(',')
                        .map(|scope| scope.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let created = state
                .api_keys
                .create(NewApiKey {
                    user_id,
                    tenant_id: TenantId::new(tenant_id),
                    name,
                    scopes,
                    expires_in_days: expires_days.map(i64::from),
                })
                .await?;

            println!("API Key created successfully!");
            println!();
            println!("  Key:     {}", created.key);
            println!("  Prefix:  {}", created.record.key_prefix);
            println!("  Tenant:  {}", created.record.tenant_id);
            if let Some(n) = &created.record.name {
                println!("  Name:    {}", n);
            }
            match created.record.expires_at {
                Some(exp) => println!("  Expires: {}", format_timestamp(exp)),
                None => println!("  Expires: Never"),
            }
            println!();
            println!("IMPORTANT: Save this key now. It cannot be retrieved later.");
            println!("Use with: -H 'Authorization: Bearer {}'", created.key);
        }
        Commands::ListApiKeys { email, active_only } => {
            let owner = match email {
                Some(email) => Some(user_id_for(&store, &email).await?),
                None => None,
            };
            let state = AppState::new(ServerConfig::default(), store);
            let now = chrono::Utc::now().timestamp();

            let api_keys: Vec<_> = state
                .api_keys
                .list(owner.as_ref())
                .await?
                .into_iter()
                .filter(|k| !active_only || (!k.is_revoked() && !k.is_expired(now)))
                .collect();

            if api_keys.is_empty() {
                println!("No API keys found.");
                return Ok(());
            }

            println!(
                "{:<20} {:<20} {:<38} {:<10} {:<22} {:<22}",
                "PREFIX", "NAME", "TENANT", "STATUS", "CREATED", "LAST USED"
            );
            println!("{}", "-".repeat(136));

            for key in api_keys {
                let status = if key.is_revoked() {
                    "Revoked"
                } else if key.is_expired(now) {
                    "Expired"
                } else {
                    "Active"
                };
                let name = key.name.clone().unwrap_or_else(|| "-".to_string());
                let last_used = key
                    .last_used_at
                    .map(format_timestamp)
                    .unwrap_or_else(|| "Never".to_string());

                println!(
                    "{:<20} {:<20} {:<38} {:<10} {:<22} {:<22}",
                    key.key_prefix,
                    name,
                    key.tenant_id,
                    status,
                    format_timestamp(key.created_at),
                    last_used
                );
            }
        }
        Commands::RevokeApiKey { key_prefix } => {
            let state = AppState::new(ServerConfig::default(), store);
            let revoked = state
                .api_keys
                .revoke(&ApiKeyPrefix::new(key_prefix.as_str()))
                .await?;

            if revoked {
                println!("API key '{}' has been revoked.", key_prefix);
            } else {
                println!("No active API key found with prefix '{}'.", key_prefix);
            }
        }
    }

    Ok(())
}

async fn open_store(db_url: &str) -> Result<SurrealStore> {
    let db_config = DatabaseConfig {
        url: db_url.to_string(),
        ..Default::default()
    };
    info!("Using database url: {}", db_config.url);
    let db = create_connection(db_config).await?;
    ensure_schema(&db).await?;
    Ok(SurrealStore::new(db))
}

async fn user_id_for(store: &SurrealStore, email: &str) -> Result<UserId> {
    let user = store
        .find_user_by_email(email)
        .await
        .with_context(|| format!("looking up user {}", email))?;
    match user {
        Some(user) => Ok(user.user_id),
        None => bail!("no user with email {}", email),
    }
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
