//! Transport-session state: execution contexts and tenant scoping.

pub mod context;
pub mod manager;

pub use context::{ExecutionContext, RequestMeta, SessionError, TenantBinding};
pub use manager::{Resolved, SelectOutcome, SessionScopeManager};
