// Core modules
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod store;
pub mod types;

// Protocol surfaces
pub mod gateway;
pub mod oauth;
pub mod server;
pub mod session;
pub mod tools;

#[cfg(test)]
mod integration_tests;

// Re-export key types and functions
pub use auth::{
    ApiKeyManager, AuthError, AuthMode, Authenticator, CreatedApiKey, Grant, NewApiKey, Principal,
};
pub use config::ServerConfig;
pub use db::{DatabaseConfig, NewUser, SurrealStore, create_connection, ensure_schema};
pub use gateway::{Gateway, SESSION_HEADER};
pub use oauth::AuthorizationServer;
pub use server::{AppState, create_router, serve};
pub use session::{ExecutionContext, SessionError, SessionScopeManager};
pub use store::{CredentialStore, Directory};
pub use tools::{ToolHandler, ToolRegistry};
pub use types::{ClientId, SessionId, TenantId, UserId};
