//! Structured tool failures.
//!
//! These are results, not transport failures: the gateway returns them to
//! the caller inside a successful response.

use std::fmt;

use rmcp::model::{CallToolResult, Content};
use serde::Serialize;
use serde_json::{Value, json};

use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Validation,
    NotFound,
    Conflict,
    NoTenantSelected,
    Forbidden,
    Internal,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::NoTenantSelected => "no_tenant_selected",
            Self::Forbidden => "forbidden",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    /// Argument the error refers to, for validation failures.
    pub field: Option<String>,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            ..Self::new(ToolErrorKind::Validation, message)
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Internal, message)
    }

    pub fn to_json(&self) -> Value {
        let mut error = json!({
            "code": self.kind.as_str(),
            "message": self.message,
        });
        if let Some(field) = &self.field {
            error["field"] = json!(field);
        }
        json!({ "error": error })
    }

    /// The failure as an `isError` tool result.
    pub fn to_call_result(&self) -> CallToolResult {
        CallToolResult {
            content: vec![Content::text(self.to_string())],
            structured_content: Some(self.to_json()),
            is_error: Some(true),
            meta: None,
        }
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ToolError {}

impl From<SessionError> for ToolError {
    fn from(e: SessionError) -> Self {
        let kind = match &e {
            SessionError::NoTenantSelected => ToolErrorKind::NoTenantSelected,
            SessionError::UnknownTenant(_) => ToolErrorKind::NotFound,
            SessionError::NotAMember(_) => ToolErrorKind::Forbidden,
            SessionError::TenantBound(_) => ToolErrorKind::Conflict,
            SessionError::Store(_) => ToolErrorKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TenantId;

    #[test]
    fn test_session_errors_map_to_kinds() {
        let e: ToolError = SessionError::NoTenantSelected.into();
        assert_eq!(e.kind, ToolErrorKind::NoTenantSelected);

        let e: ToolError = SessionError::NotAMember(TenantId::new("t1")).into();
        assert_eq!(e.kind, ToolErrorKind::Forbidden);
        assert!(e.message.contains("t1"));
    }

    #[test]
    fn test_json_shape() {
        let e = ToolError::validation("tenant_id", "tenant_id is required");
        let v = e.to_json();
        assert_eq!(v["error"]["code"], "validation");
        assert_eq!(v["error"]["field"], "tenant_id");

        let v = ToolError::not_found("nope").to_json();
        assert!(v["error"].get("field").is_none());

        let result = e.to_call_result();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(
            result.structured_content.unwrap()["error"]["code"],
            "validation"
        );
    }
}
