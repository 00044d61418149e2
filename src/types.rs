//! NewType wrappers for strong typing throughout the gateway.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a client id where a tenant id is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Stable identifier of a user in the directory.
    UserId
);

newtype_string!(
    /// Identifier of a tenant, the organizational scope that tool
    /// operations are partitioned by.
    TenantId
);

newtype_string!(
    /// Public identifier of a registered OAuth client.
    ClientId
);

newtype_string!(
    /// Opaque transport session identifier carried in the session header.
    SessionId
);

newtype_string!(
    /// Hex-encoded SHA-256 digest of a credential.
    ///
    /// Raw API keys, access tokens, refresh tokens, authorization codes and
    /// client secrets are never persisted or cached; only this digest is.
    TokenHash
);

newtype_string!(
    /// Display prefix of an API key (e.g., "sgk_Ab3dE9xZ").
    ///
    /// Safe to show in listings and logs, and used to revoke a key.
    ApiKeyPrefix
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_newtype_creation() {
        let id = TenantId::new("tenant-1");
        assert_eq!(id.as_str(), "tenant-1");
        assert_eq!(id.to_string(), "tenant-1");
    }

    #[test]
    fn test_newtype_from_conversions() {
        let a: UserId = "user-1".into();
        let b: UserId = String::from("user-1").into();
        assert_eq!(a, b);
    }

    #[test]
    fn test_newtype_serde_is_transparent() {
        let id = SessionId::new("abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc\"");

        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_newtype_borrow_allows_str_lookup() {
        let mut map = HashMap::new();
        map.insert(TokenHash::new("deadbeef"), 1);
        assert_eq!(map.get("deadbeef"), Some(&1));
    }
}
