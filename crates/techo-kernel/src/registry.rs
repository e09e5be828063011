//! Open sessions, keyed by id.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use techo_types::SessionId;

use crate::backend::ExecutionBackend;
use crate::config::SessionConfig;
use crate::data::NotebookState;
use crate::error::SessionError;
use crate::export::Exporter;
use crate::session::{Session, SessionHandle, SessionSummary};

/// Thread-safe table of running sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a session for `state` and register it.
    pub fn open(
        &self,
        state: NotebookState,
        backend: Arc<dyn ExecutionBackend>,
        exporter: Arc<dyn Exporter>,
        config: SessionConfig,
    ) -> SessionHandle {
        let handle = Session::spawn(state, backend, exporter, config);
        self.sessions.insert(handle.id(), handle.clone());
        handle
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Shut a session down and forget it. Returns false if it was not open.
    pub async fn close(&self, id: &SessionId) -> bool {
        let Some((_, handle)) = self.sessions.remove(id) else {
            return false;
        };
        match handle.shutdown().await {
            Ok(()) | Err(SessionError::Shutdown) => {}
            Err(e) => tracing::warn!(session_id = %id, error = %e, "shutdown failed"),
        }
        info!(session_id = %id, "session closed");
        true
    }

    /// Summaries of every live session. Sessions that stopped on their own
    /// are skipped.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(summary) = handle.summary().await {
                summaries.push(summary);
            }
        }
        summaries.sort_by_key(|s| s.session_id);
        summaries
    }
}
