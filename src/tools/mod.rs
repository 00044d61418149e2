//! Tool handler registry and the built-in tenant tools.
//!
//! Tools receive the caller's principal and execution context explicitly
//! through `ToolContext`.

mod error;
mod registry;
mod tenant_tools;

use std::sync::Arc;

pub use error::{ToolError, ToolErrorKind};
pub use registry::{ToolContext, ToolHandler, ToolRegistry, structured_result};
pub use rmcp::model::JsonObject;
pub use tenant_tools::{
    ClearTenantHandler, CurrentTenantHandler, ListTenantsHandler, SelectTenantHandler,
};

use crate::session::SessionScopeManager;
use crate::store::Directory;

/// Registry with the tenant tools installed.
pub fn default_registry(
    directory: Arc<dyn Directory>,
    sessions: Arc<SessionScopeManager>,
) -> ToolRegistry {
    ToolRegistry::new()
        .register_handler(ListTenantsHandler::new(directory.clone()))
        .register_handler(SelectTenantHandler::new(sessions.clone()))
        .register_handler(CurrentTenantHandler::new(directory))
        .register_handler(ClearTenantHandler::new(sessions))
}
