//! Session registry
//!
//! Owns every session the daemon knows about plus the single active-session
//! id. Starting a session supersedes the active one: it is stopped, and its
//! debug port released, before the new runtime is spawned.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::ipc::protocol::{PushMessage, SessionStateResult, SessionSummary, StatusResult};

use super::broadcast::{Broadcaster, Subscription};
use super::process;
use super::script::ScriptStore;
use super::session::SessionHandle;

/// How long a superseded runtime gets to release the debug port
const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Console lines included with the active session in a snapshot
const SNAPSHOT_CONSOLE_TAIL: usize = 20;

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<SessionHandle>>,
    /// Session ids, oldest first
    order: VecDeque<String>,
    active: Option<String>,
}

pub struct SessionRegistry {
    config: Config,
    scripts: ScriptStore,
    broadcaster: Arc<Broadcaster>,
    state: Mutex<RegistryState>,
    /// Serializes start() so two launches never race for the port
    start_lock: tokio::sync::Mutex<()>,
}

impl SessionRegistry {
    pub fn new(config: Config, scripts: ScriptStore) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast.queue_capacity));
        Self {
            config,
            scripts,
            broadcaster,
            state: Mutex::new(RegistryState::default()),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scripts(&self) -> &ScriptStore {
        &self.scripts
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_session(&self) -> Option<Arc<SessionHandle>> {
        let state = self.state();
        state.active.as_ref().and_then(|id| state.sessions.get(id).cloned())
    }

    /// Start a session running `code`
    ///
    /// Without `wait` this returns while the session is still `launching`.
    /// With `wait` it returns once the inspector is attached, or fails with
    /// the reason the attach did not happen.
    pub async fn start(&self, code: &str, break_on_start: bool, wait: bool) -> Result<SessionStateResult> {
        let session = {
            let _guard = self.start_lock.lock().await;

            if let Some(previous) = self.active_session() {
                if !previous.status().is_terminal() {
                    tracing::info!(session = %previous.id(), "Superseding active session");
                }
                previous.stop().await;
            }

            let runtime = self.config.runtime.resolve().ok_or_else(|| {
                Error::LaunchFailure(format!(
                    "runtime '{}' not found",
                    self.config.runtime.path.display()
                ))
            })?;

            let inspector = &self.config.inspector;
            if !process::wait_port_free(&inspector.host, inspector.port, PORT_RELEASE_TIMEOUT).await {
                return Err(Error::LaunchFailure(format!(
                    "debug port {} is still in use",
                    inspector.port
                )));
            }

            let script = self.scripts.create(code)?;
            let session = SessionHandle::launch(
                &self.config,
                &runtime,
                script,
                break_on_start,
                Arc::clone(&self.broadcaster),
            )?;

            let mut state = self.state();
            state.sessions.insert(session.id().to_string(), Arc::clone(&session));
            state.order.push_back(session.id().to_string());
            state.active = Some(session.id().to_string());
            self.evict(&mut state);
            session
        };

        let status = if wait {
            session.launch_outcome().await?
        } else {
            session.status()
        };
        Ok(SessionStateResult {
            session_id: session.id().to_string(),
            status,
        })
    }

    /// Drop the oldest finished sessions beyond the history limit
    fn evict(&self, state: &mut RegistryState) {
        let limit = self.config.daemon.history_limit.max(1);
        while state.order.len() > limit {
            let candidate = state.order.iter().position(|id| {
                state.active.as_ref() != Some(id)
                    && state.sessions.get(id).map_or(true, |s| s.status().is_terminal())
            });
            let Some(pos) = candidate else {
                break;
            };
            if let Some(id) = state.order.remove(pos) {
                state.sessions.remove(&id);
                tracing::debug!(session = %id, "Evicted session from history");
            }
        }
    }

    /// Look up a session; `None` means the active one
    pub fn get(&self, id: Option<&str>) -> Result<Arc<SessionHandle>> {
        let state = self.state();
        match id {
            Some(id) => state
                .sessions
                .get(id)
                .cloned()
                .ok_or_else(|| Error::SessionNotFound(id.to_string())),
            None => state
                .active
                .as_ref()
                .and_then(|id| state.sessions.get(id).cloned())
                .ok_or(Error::NoActiveSession),
        }
    }

    fn all(&self) -> Vec<Arc<SessionHandle>> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id).cloned())
            .collect()
    }

    /// Every known session, oldest first
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for session in self.all() {
            summaries.push(session.summary().await);
        }
        summaries
    }

    pub async fn stop(&self, id: Option<&str>) -> Result<SessionStateResult> {
        let session = self.get(id)?;
        let status = session.stop().await;
        Ok(SessionStateResult {
            session_id: session.id().to_string(),
            status,
        })
    }

    /// Register a push observer
    ///
    /// Events published from now on are queued for it; send it
    /// [`SessionRegistry::snapshot`] first.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.broadcaster.unsubscribe(subscription.id);
    }

    /// Full current state, as sent to a newly connected observer
    pub async fn snapshot(&self) -> PushMessage {
        let active = match self.active_session() {
            Some(session) => Some(session.detail(SNAPSHOT_CONSOLE_TAIL).await),
            None => None,
        };
        PushMessage::Snapshot {
            active,
            sessions: self.list().await,
        }
    }

    pub fn status(&self) -> StatusResult {
        let state = self.state();
        StatusResult {
            daemon_running: true,
            pid: std::process::id(),
            active_session: state.active.clone(),
            session_count: state.sessions.len(),
            observers: self.broadcaster.subscriber_count(),
        }
    }

    /// Whether any session still holds a runtime
    pub fn has_live_session(&self) -> bool {
        self.active_session()
            .map_or(false, |s| !s.status().is_terminal())
    }

    /// Stop every session that is still live
    pub async fn shutdown(&self) {
        for session in self.all() {
            if !session.status().is_terminal() {
                session.stop().await;
            }
        }
    }
}
