//! Per-session execution context.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::RwLock;

use crate::auth::{AuthMode, Principal};
use crate::types::{SessionId, TenantId, UserId};

/// Session-level failures surfaced to tool logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A tenant-scoped operation ran before any tenant was selected.
    NoTenantSelected,
    /// The tenant does not exist (or no longer exists).
    UnknownTenant(TenantId),
    /// The caller is not a member of the tenant.
    NotAMember(TenantId),
    /// API key sessions are permanently bound to their key's tenant.
    TenantBound(TenantId),
    /// Backing store failure.
    Store(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTenantSelected => {
                write!(f, "No tenant selected; call tenant.select first")
            }
            Self::UnknownTenant(id) => write!(f, "Tenant not found: {}", id),
            Self::NotAMember(id) => write!(f, "Not a member of tenant {}", id),
            Self::TenantBound(id) => {
                write!(f, "Session is bound to tenant {} by its API key", id)
            }
            Self::Store(msg) => write!(f, "Session store error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Metadata about the request that created a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub request_id: String,
    pub user_agent: Option<String>,
}

/// Which tenant a session operates on.
#[derive(Debug)]
pub enum TenantBinding {
    /// API key sessions: fixed at creation, never changes.
    Fixed(TenantId),
    /// OAuth sessions: starts empty, changed through selection.
    Selectable(RwLock<Option<TenantId>>),
}

/// Runtime state bound to one transport session.
///
/// Everything except the selected tenant is immutable after construction.
#[derive(Debug)]
pub struct ExecutionContext {
    session_id: SessionId,
    user_id: UserId,
    auth_mode: AuthMode,
    binding: TenantBinding,
    meta: RequestMeta,
    created_at: i64,
    last_seen: AtomicI64,
}

impl ExecutionContext {
    pub fn new(session_id: SessionId, principal: &Principal, meta: RequestMeta, now: i64) -> Self {
        let binding = match principal.bound_tenant() {
            Some(tenant_id) => TenantBinding::Fixed(tenant_id.clone()),
            None => TenantBinding::Selectable(RwLock::new(None)),
        };
        Self {
            session_id,
            user_id: principal.user_id.clone(),
            auth_mode: principal.auth_mode(),
            binding,
            meta,
            created_at: now,
            last_seen: AtomicI64::new(now),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn binding(&self) -> &TenantBinding {
        &self.binding
    }

    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now: i64) {
        self.last_seen.fetch_max(now, Ordering::Relaxed);
    }

    /// Currently selected (or bound) tenant, if any.
    pub async fn selected_tenant(&self) -> Option<TenantId> {
        match &self.binding {
            TenantBinding::Fixed(tenant_id) => Some(tenant_id.clone()),
            TenantBinding::Selectable(selected) => selected.read().await.clone(),
        }
    }

    /// Tenant for a tenant-scoped operation, or `NoTenantSelected`.
    pub async fn require_tenant(&self) -> Result<TenantId, SessionError> {
        self.selected_tenant()
            .await
            .ok_or(SessionError::NoTenantSelected)
    }

    /// Whether `principal` may use this context: same user, same kind of
    /// credential, and for API keys the same bound tenant.
    pub fn owned_by(&self, principal: &Principal) -> bool {
        if principal.user_id != self.user_id || principal.auth_mode() != self.auth_mode {
            return false;
        }
        match &self.binding {
            TenantBinding::Fixed(tenant_id) => principal.bound_tenant() == Some(tenant_id),
            TenantBinding::Selectable(_) => principal.bound_tenant().is_none(),
        }
    }

    /// Set a restored selection before the context is shared. Does not emit
    /// any durability command.
    pub(crate) async fn hydrate(&self, tenant_id: TenantId) {
        if let TenantBinding::Selectable(selected) = &self.binding {
            *selected.write().await = Some(tenant_id);
        }
    }
}
