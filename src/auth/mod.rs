//! Credential verification and API key management.

pub mod api_keys;
pub mod authenticator;
pub mod principal;
pub mod token;

pub use api_keys::{ApiKeyManager, CreatedApiKey, NewApiKey};
pub use authenticator::{AuthError, Authenticator};
pub use principal::{AuthMode, Grant, Principal};
pub use token::{
    API_KEY_PREFIX, generate_api_key, generate_oauth_token, generate_secure_token, hash_token,
    is_api_key,
};
