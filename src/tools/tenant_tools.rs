//! Built-in tools for inspecting and changing the session's tenant.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmcp::model::{CallToolResult, JsonObject};
use serde_json::{Value, json};
use tracing::error;

use crate::auth::AuthMode;
use crate::session::{SelectOutcome, SessionScopeManager};
use crate::store::Directory;
use crate::tools::error::{ToolError, ToolErrorKind};
use crate::tools::registry::{ToolContext, ToolHandler, structured_result};
use crate::types::TenantId;

type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'a>>;

fn schema(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

fn empty_schema() -> JsonObject {
    schema(json!({ "type": "object", "properties": {}, "additionalProperties": false }))
}

/// `tenant.list`: tenants the caller belongs to.
pub struct ListTenantsHandler {
    directory: Arc<dyn Directory>,
}

impl ListTenantsHandler {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }
}

impl ToolHandler for ListTenantsHandler {
    fn name(&self) -> &str {
        "tenant.list"
    }

    fn title(&self) -> Option<&str> {
        Some("List Tenants")
    }

    fn description(&self) -> &str {
        "List the tenants you are a member of, marking the one this session is scoped to."
    }

    fn input_schema(&self) -> JsonObject {
        empty_schema()
    }

    fn execute(&self, _args: JsonObject, ctx: &ToolContext) -> ToolFuture<'_> {
        let ctx = ctx.clone();
        Box::pin(async move {
            let tenants = self
                .directory
                .list_tenants_for_user(&ctx.principal.user_id)
                .await
                .map_err(|e| {
                    error!("failed to list tenants: {:#}", e);
                    ToolError::internal("failed to list tenants")
                })?;
            let current = ctx.context.selected_tenant().await;

            let tenants: Vec<Value> = tenants
                .into_iter()
                .map(|t| {
                    json!({
                        "tenant_id": t.tenant_id,
                        "name": t.name,
                        "selected": current.as_ref() == Some(&t.tenant_id),
                    })
                })
                .collect();

            Ok(structured_result(json!({
                "auth_mode": ctx.principal.auth_mode().as_str(),
                "selected_tenant_id": current,
                "tenants": tenants,
            })))
        })
    }
}

/// `tenant.select`: scope this session to a tenant.
pub struct SelectTenantHandler {
    sessions: Arc<SessionScopeManager>,
}

impl SelectTenantHandler {
    pub fn new(sessions: Arc<SessionScopeManager>) -> Self {
        Self { sessions }
    }
}

impl ToolHandler for SelectTenantHandler {
    fn name(&self) -> &str {
        "tenant.select"
    }

    fn title(&self) -> Option<&str> {
        Some("Select Tenant")
    }

    fn description(&self) -> &str {
        "Scope this session to one of your tenants. Sessions authenticated \
         with an API key are bound to the key's tenant and report it unchanged."
    }

    fn input_schema(&self) -> JsonObject {
        schema(json!({
            "type": "object",
            "properties": {
                "tenant_id": {
                    "type": "string",
                    "description": "Tenant to scope subsequent tool calls to.",
                }
            },
            "required": ["tenant_id"],
        }))
    }

    fn execute(&self, args: JsonObject, ctx: &ToolContext) -> ToolFuture<'_> {
        let ctx = ctx.clone();
        Box::pin(async move {
            let tenant_id = args
                .get("tenant_id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ToolError::validation("tenant_id", "tenant_id is required"))?;

            let outcome = self
                .sessions
                .select(&ctx.context, &TenantId::new(tenant_id))
                .await?;
            let already_bound = matches!(outcome, SelectOutcome::AlreadyBound(_));

            Ok(structured_result(json!({
                "tenant_id": outcome.tenant_id(),
                "auth_mode": ctx.context.auth_mode().as_str(),
                "changed": !already_bound,
            })))
        })
    }
}

/// `tenant.current`: the tenant this session is scoped to.
pub struct CurrentTenantHandler {
    directory: Arc<dyn Directory>,
}

impl CurrentTenantHandler {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }
}

impl ToolHandler for CurrentTenantHandler {
    fn name(&self) -> &str {
        "tenant.current"
    }

    fn description(&self) -> &str {
        "Show the tenant this session is scoped to."
    }

    fn input_schema(&self) -> JsonObject {
        empty_schema()
    }

    fn execute(&self, _args: JsonObject, ctx: &ToolContext) -> ToolFuture<'_> {
        let ctx = ctx.clone();
        Box::pin(async move {
            let tenant_id = ctx.context.require_tenant().await?;
            let tenant = self
                .directory
                .find_tenant(&tenant_id)
                .await
                .map_err(|e| {
                    error!("failed to load tenant: {:#}", e);
                    ToolError::internal("failed to load tenant")
                })?
                .ok_or_else(|| ToolError::not_found(format!("Tenant not found: {}", tenant_id)))?;

            Ok(structured_result(json!({
                "tenant_id": tenant.tenant_id,
                "name": tenant.name,
                "auth_mode": ctx.context.auth_mode().as_str(),
            })))
        })
    }
}

/// `tenant.clear`: drop the session's selection (OAuth sessions only).
pub struct ClearTenantHandler {
    sessions: Arc<SessionScopeManager>,
}

impl ClearTenantHandler {
    pub fn new(sessions: Arc<SessionScopeManager>) -> Self {
        Self { sessions }
    }
}

impl ToolHandler for ClearTenantHandler {
    fn name(&self) -> &str {
        "tenant.clear"
    }

    fn description(&self) -> &str {
        "Clear this session's tenant selection."
    }

    fn input_schema(&self) -> JsonObject {
        empty_schema()
    }

    fn execute(&self, _args: JsonObject, ctx: &ToolContext) -> ToolFuture<'_> {
        let ctx = ctx.clone();
        Box::pin(async move {
            if ctx.context.auth_mode() == AuthMode::ApiKey {
                return Err(ToolError::new(
                    ToolErrorKind::Conflict,
                    "API key sessions are bound to the key's tenant",
                ));
            }
            self.sessions.clear(&ctx.context).await?;
            Ok(structured_result(json!({ "cleared": true })))
        })
    }
}
