//! Credential generation and hashing.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::types::{ApiKeyPrefix, TokenHash};

/// Every API key starts with this marker; OAuth tokens never do.
pub const API_KEY_PREFIX: &str = "sgk_";

/// Characters of an API key kept as its display prefix.
const DISPLAY_PREFIX_LEN: usize = 12;

/// Hash a credential for storage and lookup (don't store raw secrets).
pub fn hash_token(raw: &str) -> TokenHash {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    TokenHash::new(format!("{:x}", hasher.finalize()))
}

/// 32 random bytes, base64url without padding.
pub fn generate_secure_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Random token suitable for OAuth codes and tokens.
///
/// Never collides syntactically with the API key prefix, so classification
/// by prefix stays unambiguous.
pub fn generate_oauth_token() -> String {
    loop {
        let token = generate_secure_token();
        if !is_api_key(&token) {
            return token;
        }
    }
}

/// Generate a new API key. Returns (full_key, display_prefix, hash).
pub fn generate_api_key() -> (String, ApiKeyPrefix, TokenHash) {
    let full_key = format!("{}{}", API_KEY_PREFIX, generate_secure_token());
    let prefix = ApiKeyPrefix::new(&full_key[..DISPLAY_PREFIX_LEN]);
    let key_hash = hash_token(&full_key);
    (full_key, prefix, key_hash)
}

/// Syntactic classification only; nothing is trusted until looked up.
pub fn is_api_key(raw: &str) -> bool {
    raw.starts_with(API_KEY_PREFIX)
}
