//! OAuth 2.1 authorization server for MCP clients.

pub mod error;
pub mod login_page;
pub mod pkce;
pub mod routes;
pub mod server;
pub mod types;

pub use error::{AuthorizeError, OAuthError, OAuthErrorCode};
pub use routes::oauth_router;
pub use server::{AuthorizationServer, LoginOutcome, ValidatedAuthorization};
