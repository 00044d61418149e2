//! Session-scope manager: resolves execution contexts for transport sessions
//! and keeps tenant selections durable across restarts.
//!
//! Contexts live in an in-process cache. When a presented session id is not
//! cached, the selection is restored from, in order: the in-process
//! selection cache, the session's persisted scope row, and the user's most
//! recent persisted selection. Writes to the store go through a single
//! background worker so they never delay the request that caused them.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthMode, Principal};
use crate::cache::ConcurrentCache;
use crate::db::SessionScopeRecord;
use crate::session::context::{ExecutionContext, RequestMeta, SessionError, TenantBinding};
use crate::store::{CredentialStore, Directory};
use crate::types::{SessionId, TenantId, UserId};

/// Outcome of a resolve call.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub context: Arc<ExecutionContext>,
    /// True when a new session id was created; the caller must surface it.
    pub minted: bool,
}

/// Outcome of a selection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// The session is bound by its API key; nothing changed.
    AlreadyBound(TenantId),
    Selected(TenantId),
}

impl SelectOutcome {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::AlreadyBound(tenant_id) | Self::Selected(tenant_id) => tenant_id,
        }
    }
}

#[derive(Debug, Clone)]
struct TenantSelection {
    user_id: UserId,
    tenant_id: TenantId,
}

enum DurabilityCommand {
    Persist(SessionScopeRecord),
    Remove(SessionId),
    Flush(oneshot::Sender<()>),
}

enum Restoration {
    Nothing,
    Found(TenantId),
    /// The id's persisted scope belongs to another user.
    Foreign,
}

pub struct SessionScopeManager {
    contexts: ConcurrentCache<SessionId, Arc<ExecutionContext>>,
    selections: ConcurrentCache<SessionId, TenantSelection>,
    store: Arc<dyn CredentialStore>,
    directory: Arc<dyn Directory>,
    durability: mpsc::UnboundedSender<DurabilityCommand>,
    idle_ttl_secs: i64,
}

impl SessionScopeManager {
    /// Create the manager and start its durability worker. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        directory: Arc<dyn Directory>,
        capacity: usize,
        idle_ttl_secs: i64,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(durability_worker(store.clone(), rx));

        Self {
            contexts: ConcurrentCache::new(capacity),
            selections: ConcurrentCache::new(capacity),
            store,
            directory,
            durability: tx,
            idle_ttl_secs,
        }
    }

    /// Find or create the execution context for a request.
    pub async fn resolve(
        &self,
        session_id: Option<&str>,
        principal: &Principal,
        meta: RequestMeta,
    ) -> Result<Resolved, SessionError> {
        let now = chrono::Utc::now().timestamp();
        let presented = session_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(SessionId::new);

        let Some(session_id) = presented else {
            return Ok(self.mint(principal, meta, now));
        };

        if let Some(context) = self.contexts.get(&session_id) {
            if context.owned_by(principal) {
                context.touch(now);
                return Ok(Resolved {
                    context,
                    minted: false,
                });
            }
            warn!(
                session_id = %session_id,
                user_id = %principal.user_id,
                "session id presented by another principal; starting a new session"
            );
            return Ok(self.mint(principal, meta, now));
        }

        let context = Arc::new(ExecutionContext::new(
            session_id.clone(),
            principal,
            meta.clone(),
            now,
        ));
        if principal.auth_mode() == AuthMode::OAuth {
            match self.restore(&session_id, &principal.user_id).await? {
                Restoration::Found(tenant_id) => {
                    info!(session_id = %session_id, tenant_id = %tenant_id, "session scope restored");
                    context.hydrate(tenant_id).await;
                }
                Restoration::Nothing => {}
                Restoration::Foreign => {
                    warn!(
                        session_id = %session_id,
                        user_id = %principal.user_id,
                        "persisted session scope belongs to another user; starting a new session"
                    );
                    return Ok(self.mint(principal, meta, now));
                }
            }
        }

        // A concurrent request may have restored the same id first.
        let cached = self.contexts.get_or_insert(session_id, context);
        if !cached.owned_by(principal) {
            return Ok(self.mint(principal, meta, now));
        }
        cached.touch(now);
        Ok(Resolved {
            context: cached,
            minted: false,
        })
    }

    /// Select a tenant for the session. API key sessions report their bound
    /// tenant and change nothing.
    pub async fn select(
        &self,
        context: &ExecutionContext,
        tenant_id: &TenantId,
    ) -> Result<SelectOutcome, SessionError> {
        let selected = match context.binding() {
            TenantBinding::Fixed(bound) => return Ok(SelectOutcome::AlreadyBound(bound.clone())),
            TenantBinding::Selectable(selected) => selected,
        };

        self.check_access(context.user_id(), tenant_id).await?;

        let mut guard = selected.write().await;
        *guard = Some(tenant_id.clone());
        self.selections.put(
            context.session_id().clone(),
            TenantSelection {
                user_id: context.user_id().clone(),
                tenant_id: tenant_id.clone(),
            },
        );
        // Enqueued under the lock so the store sees selections in lock order.
        self.send(DurabilityCommand::Persist(SessionScopeRecord {
            session_id: context.session_id().clone(),
            user_id: context.user_id().clone(),
            tenant_id: Some(tenant_id.clone()),
            updated_at: chrono::Utc::now().timestamp(),
        }));
        drop(guard);

        info!(
            session_id = %context.session_id(),
            tenant_id = %tenant_id,
            "tenant selected"
        );
        Ok(SelectOutcome::Selected(tenant_id.clone()))
    }

    /// Clear the session's selection in memory and in the store.
    pub async fn clear(&self, context: &ExecutionContext) -> Result<(), SessionError> {
        let selected = match context.binding() {
            TenantBinding::Fixed(bound) => return Err(SessionError::TenantBound(bound.clone())),
            TenantBinding::Selectable(selected) => selected,
        };

        let mut guard = selected.write().await;
        *guard = None;
        self.selections.invalidate(context.session_id());
        // An empty row, not a deletion: a missing row would fall back to the
        // user's latest selection from another session.
        self.send(DurabilityCommand::Persist(SessionScopeRecord {
            session_id: context.session_id().clone(),
            user_id: context.user_id().clone(),
            tenant_id: None,
            updated_at: chrono::Utc::now().timestamp(),
        }));
        drop(guard);

        self.flush().await;
        info!(session_id = %context.session_id(), "tenant selection cleared");
        Ok(())
    }

    /// End a session at its owner's request: forget the context and its
    /// selection everywhere. Returns false if the caller does not own it.
    pub fn terminate(&self, session_id: &SessionId, principal: &Principal) -> bool {
        match self.contexts.get(session_id) {
            Some(context) if context.owned_by(principal) => {
                self.selections.invalidate(session_id);
                if matches!(context.binding(), TenantBinding::Selectable(_)) {
                    self.send(DurabilityCommand::Remove(session_id.clone()));
                }
                self.evict(session_id);
                info!(session_id = %session_id, "session terminated");
                true
            }
            _ => false,
        }
    }

    /// Drop a context from memory. Its selection survives in the store.
    pub fn evict(&self, session_id: &SessionId) -> bool {
        self.contexts.invalidate(session_id).is_some()
    }

    /// Drop contexts unused for longer than the idle TTL.
    pub fn evict_idle(&self, now: i64) -> usize {
        let ttl = self.idle_ttl_secs;
        let evicted = self
            .contexts
            .retain(|_, context| now - context.last_seen() < ttl);
        if evicted > 0 {
            debug!(evicted, "idle sessions evicted");
        }
        evicted
    }

    pub fn active_sessions(&self) -> usize {
        self.contexts.len()
    }

    /// Wait until every durability command queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(DurabilityCommand::Flush(tx));
        let _ = rx.await;
    }

    fn mint(&self, principal: &Principal, meta: RequestMeta, now: i64) -> Resolved {
        let session_id = SessionId::new(Uuid::new_v4().to_string());
        let context = Arc::new(ExecutionContext::new(
            session_id.clone(),
            principal,
            meta,
            now,
        ));
        self.contexts.put(session_id.clone(), context.clone());
        debug!(session_id = %session_id, user_id = %principal.user_id, "session created");
        Resolved {
            context,
            minted: true,
        }
    }

    async fn restore(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Restoration, SessionError> {
        if let Some(selection) = self.selections.get(session_id) {
            if &selection.user_id != user_id {
                return Ok(Restoration::Foreign);
            }
            debug!(session_id = %session_id, "restoring scope from selection cache");
            return self.validated(session_id, user_id, selection.tenant_id).await;
        }

        let row = self
            .store
            .find_session_scope(session_id)
            .await
            .map_err(store_error)?;
        if let Some(row) = row {
            if &row.user_id != user_id {
                return Ok(Restoration::Foreign);
            }
            return match row.tenant_id {
                Some(tenant_id) => {
                    debug!(session_id = %session_id, "restoring scope from session row");
                    self.validated(session_id, user_id, tenant_id).await
                }
                None => Ok(Restoration::Nothing),
            };
        }

        let latest = self
            .store
            .latest_session_scope_for_user(user_id)
            .await
            .map_err(store_error)?;
        let Some(tenant_id) = latest.and_then(|row| row.tenant_id) else {
            return Ok(Restoration::Nothing);
        };
        debug!(session_id = %session_id, "restoring scope from the user's latest selection");
        let restored = self.validated(session_id, user_id, tenant_id).await?;
        if let Restoration::Found(tenant_id) = &restored {
            // Carry the selection over to the new session id.
            self.selections.put(
                session_id.clone(),
                TenantSelection {
                    user_id: user_id.clone(),
                    tenant_id: tenant_id.clone(),
                },
            );
            self.send(DurabilityCommand::Persist(SessionScopeRecord {
                session_id: session_id.clone(),
                user_id: user_id.clone(),
                tenant_id: Some(tenant_id.clone()),
                updated_at: chrono::Utc::now().timestamp(),
            }));
        }
        Ok(restored)
    }

    async fn validated(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        tenant_id: TenantId,
    ) -> Result<Restoration, SessionError> {
        match self.check_access(user_id, &tenant_id).await {
            Ok(()) => Ok(Restoration::Found(tenant_id)),
            Err(SessionError::Store(msg)) => Err(SessionError::Store(msg)),
            Err(e) => {
                warn!(session_id = %session_id, "skipping restored scope: {}", e);
                Ok(Restoration::Nothing)
            }
        }
    }

    async fn check_access(&self, user_id: &UserId, tenant_id: &TenantId) -> Result<(), SessionError> {
        let tenant = self
            .directory
            .find_tenant(tenant_id)
            .await
            .map_err(store_error)?;
        if tenant.is_none() {
            return Err(SessionError::UnknownTenant(tenant_id.clone()));
        }
        let member = self
            .directory
            .is_member(user_id, tenant_id)
            .await
            .map_err(store_error)?;
        if !member {
            return Err(SessionError::NotAMember(tenant_id.clone()));
        }
        Ok(())
    }

    fn send(&self, command: DurabilityCommand) {
        if self.durability.send(command).is_err() {
            warn!("session durability worker is gone; write dropped");
        }
    }
}

fn store_error(e: anyhow::Error) -> SessionError {
    SessionError::Store(e.to_string())
}

/// Applies durability commands in the order they were queued. Failures are
/// logged and dropped; the in-memory state stays authoritative.
async fn durability_worker(
    store: Arc<dyn CredentialStore>,
    mut rx: mpsc::UnboundedReceiver<DurabilityCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            DurabilityCommand::Persist(record) => {
                if let Err(e) = store.upsert_session_scope(&record).await {
                    warn!(session_id = %record.session_id, "failed to persist session scope: {:#}", e);
                }
            }
            DurabilityCommand::Remove(session_id) => {
                if let Err(e) = store.delete_session_scope(&session_id).await {
                    warn!(session_id = %session_id, "failed to delete session scope: {:#}", e);
                }
            }
            DurabilityCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("session durability worker stopped");
}
