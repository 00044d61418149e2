//! HTTP server assembly: shared state, router composition and serving.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{Json, Router, http::StatusCode, routing::get};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{ApiKeyManager, Authenticator};
use crate::config::ServerConfig;
use crate::db::SurrealStore;
use crate::gateway::{Gateway, gateway_router};
use crate::oauth::{AuthorizationServer, oauth_router};
use crate::session::SessionScopeManager;
use crate::store::{CredentialStore, Directory};
use crate::tools::default_registry;

/// How often idle sessions are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Every long-lived component, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub authenticator: Arc<Authenticator>,
    pub oauth: Arc<AuthorizationServer>,
    pub sessions: Arc<SessionScopeManager>,
    pub api_keys: Arc<ApiKeyManager>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Wire the components over one store. Must be called inside a Tokio
    /// runtime.
    pub fn new(config: ServerConfig, store: SurrealStore) -> Self {
        let config = Arc::new(config);
        let shared = Arc::new(store);
        let credentials: Arc<dyn CredentialStore> = shared.clone();
        let directory: Arc<dyn Directory> = shared;

        let authenticator = Arc::new(Authenticator::new(
            credentials.clone(),
            directory.clone(),
            &config,
        ));
        let oauth = Arc::new(AuthorizationServer::new(
            config.clone(),
            credentials.clone(),
            directory.clone(),
            authenticator.clone(),
        ));
        let sessions = Arc::new(SessionScopeManager::new(
            credentials.clone(),
            directory.clone(),
            config.session_cache_capacity,
            config.session_idle_ttl_secs,
        ));
        let api_keys = Arc::new(ApiKeyManager::new(
            credentials,
            directory.clone(),
            authenticator.clone(),
        ));
        let tools = Arc::new(default_registry(directory, sessions.clone()));
        let gateway = Arc::new(Gateway::new(
            config.clone(),
            authenticator.clone(),
            sessions.clone(),
            tools,
        ));

        Self {
            config,
            authenticator,
            oauth,
            sessions,
            api_keys,
            gateway,
        }
    }
}

pub fn create_router(state: &AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(oauth_router(state.oauth.clone()))
        .merge(gateway_router(state.gateway.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Periodically drop execution contexts that have gone idle.
pub fn spawn_idle_sweeper(sessions: Arc<SessionScopeManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sessions.evict_idle(chrono::Utc::now().timestamp());
        }
    })
}

/// Serve until Ctrl-C, then flush pending session writes.
pub async fn serve(state: AppState) -> Result<()> {
    let router = create_router(&state);
    let listener = tokio::net::TcpListener::bind(&state.config.bind).await?;
    let sweeper = spawn_idle_sweeper(state.sessions.clone());

    info!(
        "listening on http://{} (issuer {})",
        state.config.bind,
        state.config.issuer()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    sweeper.abort();
    state.sessions.flush().await;
    info!("server stopped");
    Ok(())
}
