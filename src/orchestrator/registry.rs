//! Session registry.
//!
//! Owns every live [`DebugSession`] keyed by [`SessionId`]. Registry
//! operations serialize on one lock, but the lock is never held across a
//! session's own I/O: creation reserves an identifier under the lock, runs
//! the transport open and handshake outside it, then inserts. A watcher task
//! per session removes the entry once the session reaches `Terminated`, for
//! whatever reason.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, info_span, Instrument};

use crate::config::BridgeConfig;
use crate::models::session::{SessionId, SessionInfo, SessionState};
use crate::orchestrator::handshake::SessionRequest;
use crate::orchestrator::session::{DebugSession, SessionData, SessionSettings};
use crate::{AppError, Result};

struct RegistryEntry {
    ordinal: u64,
    session: Arc<DebugSession>,
}

#[derive(Default)]
struct RegistryState {
    next_ordinal: u64,
    /// Every identifier ever handed out, live or not.
    issued: HashSet<SessionId>,
    entries: HashMap<SessionId, RegistryEntry>,
}

struct RegistryInner {
    settings: SessionSettings,
    state: Mutex<RegistryState>,
}

/// Registry of concurrent debug sessions.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}

impl SessionRegistry {
    /// Create an empty registry whose sessions use `settings`.
    #[must_use]
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Create an empty registry configured from `config`.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(SessionSettings::from(config))
    }

    /// Settings applied to new sessions.
    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Open the endpoint, run the handshake, and register the session.
    ///
    /// # Errors
    ///
    /// Surfaces the spawn/connect or handshake failure verbatim. The
    /// identifier reserved for a failed attempt is never reused.
    pub async fn create_session(&self, request: SessionRequest) -> Result<SessionId> {
        let (id, ordinal) = self.reserve().await;
        let span = info_span!("create_session", session_id = %id, adapter = %request.adapter);

        let session = DebugSession::open(id.clone(), &request, self.inner.settings.clone())
            .instrument(span)
            .await?;
        self.register(id.clone(), ordinal, session).await;
        Ok(id)
    }

    /// Register a session that was started elsewhere (for example over an
    /// in-memory transport).
    pub async fn adopt(&self, session: Arc<DebugSession>) -> SessionId {
        let id = session.id().clone();
        let ordinal = {
            let mut state = self.inner.state.lock().await;
            state.issued.insert(id.clone());
            let ordinal = state.next_ordinal;
            state.next_ordinal += 1;
            ordinal
        };
        self.register(id.clone(), ordinal, session).await;
        id
    }

    async fn reserve(&self) -> (SessionId, u64) {
        let mut state = self.inner.state.lock().await;
        let id = loop {
            let candidate = SessionId::generate();
            if !state.issued.contains(&candidate) {
                break candidate;
            }
        };
        state.issued.insert(id.clone());
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        (id, ordinal)
    }

    async fn register(&self, id: SessionId, ordinal: u64, session: Arc<DebugSession>) {
        let watcher = session.state_receiver();
        self.inner
            .state
            .lock()
            .await
            .entries
            .insert(id.clone(), RegistryEntry { ordinal, session });
        info!(session_id = %id, ordinal, "session registered");

        spawn_watcher(Arc::downgrade(&self.inner), id, watcher);
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// [`AppError::SessionNotFound`] if no live session has this identifier.
    pub async fn get_session(&self, id: &SessionId) -> Result<Arc<DebugSession>> {
        self.inner
            .state
            .lock()
            .await
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    /// Terminate a session and drop it from the registry.
    ///
    /// Terminating an identifier that was issued but is already gone
    /// succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// [`AppError::SessionNotFound`] if the identifier was never issued.
    pub async fn terminate_session(&self, id: &SessionId) -> Result<()> {
        let session = {
            let state = self.inner.state.lock().await;
            match state.entries.get(id) {
                Some(entry) => Arc::clone(&entry.session),
                None if state.issued.contains(id) => {
                    debug!(session_id = %id, "terminate ignored, session already gone");
                    return Ok(());
                }
                None => return Err(AppError::SessionNotFound(id.to_string())),
            }
        };

        session.terminate(self.inner.settings.timeouts.terminate()).await;
        self.inner.state.lock().await.entries.remove(id);
        Ok(())
    }

    /// Terminate every session, each bounded by `bound`.
    pub async fn terminate_all(&self, bound: Duration) {
        let sessions: Vec<Arc<DebugSession>> = {
            let mut state = self.inner.state.lock().await;
            state.entries.drain().map(|(_, entry)| entry.session).collect()
        };
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "terminating all sessions");
        join_all(sessions.iter().map(|session| session.terminate(bound))).await;
    }

    /// Live session identifiers in creation order.
    pub async fn list_sessions(&self) -> Vec<SessionId> {
        self.ordered().await.iter().map(|s| s.id().clone()).collect()
    }

    /// Snapshots of live sessions in creation order.
    pub async fn session_infos(&self) -> Vec<SessionInfo> {
        self.ordered().await.iter().map(|s| s.info()).collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn ordered(&self) -> Vec<Arc<DebugSession>> {
        let state = self.inner.state.lock().await;
        let mut entries: Vec<&RegistryEntry> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.ordinal);
        entries
            .into_iter()
            .map(|entry| Arc::clone(&entry.session))
            .collect()
    }
}

/// Remove `id` from the registry once its session terminates.
fn spawn_watcher(
    registry: Weak<RegistryInner>,
    id: SessionId,
    mut watcher: watch::Receiver<SessionData>,
) {
    tokio::spawn(async move {
        let _ = watcher
            .wait_for(|data| data.state == SessionState::Terminated)
            .await
            .map(|_| ());

        let Some(registry) = registry.upgrade() else {
            return;
        };
        if registry.state.lock().await.entries.remove(&id).is_some() {
            info!(session_id = %id, "terminated session removed from registry");
        }
    });
}
