/// Registry of live sessions
/// Each session runs as its own task fed by a bounded command queue; the
/// registry map is guarded by a coarse lock since sessions come and go far
/// less often than edits arrive
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    CollabConfig, CollaborationError, MergeStrategy, ParticipantId, Permissions, ReportDocument,
    ReportId, Result, Session, SessionId, SessionSettings, SessionState, SessionSummary,
};

type Job = Box<dyn FnOnce(&mut SessionState) + Send>;

/// Cheap handle to a session task
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    report_id: ReportId,
    tx: mpsc::Sender<Job>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn report_id(&self) -> ReportId {
        self.report_id
    }

    fn gone(&self) -> CollaborationError {
        CollaborationError::NotFound(format!("session {}", self.id))
    }

    /// Run `f` on the session task and wait for its result
    pub async fn request<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SessionState) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |state| {
            let _ = reply_tx.send(f(state));
        });
        self.tx.send(job).await.map_err(|_| self.gone())?;
        reply_rx.await.map_err(|_| self.gone())
    }

    /// Queue `f` without waiting; shed when the queue is full.
    ///
    /// Only for presence traffic that a newer update supersedes anyway.
    pub fn notify<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SessionState) + Send + 'static,
    {
        match self.tx.try_send(Box::new(f)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(session = %self.id, "session queue full, dropping presence update");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("report_id", &self.report_id)
            .finish()
    }
}

struct Entry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Entry>,
    by_report: HashMap<ReportId, SessionId>,
}

pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    config: CollabConfig,
    merger: Arc<dyn MergeStrategy>,
}

impl SessionRegistry {
    pub fn new(config: CollabConfig, merger: Arc<dyn MergeStrategy>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            config,
            merger,
        }
    }

    /// Start the one live session of a report
    pub async fn start(
        &self,
        document: ReportDocument,
        permissions: HashMap<ParticipantId, Permissions>,
        settings: Option<SessionSettings>,
    ) -> Result<(Session, SessionHandle)> {
        let report_id = document.report_id;
        let mut state = self.state.write().await;
        if state.by_report.contains_key(&report_id) {
            return Err(CollaborationError::AlreadyActive(report_id));
        }

        let id = SessionId::new();
        let session_state = SessionState::new(
            id,
            document,
            permissions,
            settings.unwrap_or_else(|| self.config.default_settings.clone()),
            self.merger.clone(),
            &self.config,
        );
        let session = session_state.snapshot();

        let (tx, rx) = mpsc::channel(self.config.session_queue_capacity.max(1));
        let task = tokio::spawn(run_session(session_state, rx));
        let handle = SessionHandle { id, report_id, tx };

        state.by_report.insert(report_id, id);
        state.sessions.insert(
            id,
            Entry {
                handle: handle.clone(),
                task,
            },
        );
        info!(session = %id, report = %report_id, "session started");
        Ok((session, handle))
    }

    pub async fn get(&self, id: &SessionId) -> Result<SessionHandle> {
        self.state
            .read()
            .await
            .sessions
            .get(id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| CollaborationError::NotFound(format!("session {id}")))
    }

    pub async fn for_report(&self, report_id: &ReportId) -> Option<SessionHandle> {
        let state = self.state.read().await;
        let id = state.by_report.get(report_id)?;
        state.sessions.get(id).map(|e| e.handle.clone())
    }

    /// End a session; `caller` must administer it unless the service itself ends it
    pub async fn end(&self, id: &SessionId, caller: Option<ParticipantId>) -> Result<()> {
        let handle = self.get(id).await?;
        handle
            .request(move |s| s.end(caller.as_ref()))
            .await??;

        let mut state = self.state.write().await;
        if let Some(entry) = state.sessions.remove(id) {
            state.by_report.remove(&entry.handle.report_id);
            drop(entry.handle);
            if let Err(e) = entry.task.await {
                warn!(session = %id, error = %e, "session task failed");
            }
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self
            .state
            .read()
            .await
            .sessions
            .values()
            .map(|e| e.handle.clone())
            .collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(summary) = handle.request(|s| s.summary()).await {
                out.push(summary);
            }
        }
        out
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.state
            .read()
            .await
            .sessions
            .values()
            .map(|e| e.handle.clone())
            .collect()
    }

    /// End every session and wait for their tasks
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.state.read().await.sessions.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.end(&id, None).await {
                warn!(session = %id, error = %e, "failed to end session on shutdown");
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

/// Single writer for one session's state
async fn run_session(mut state: SessionState, mut rx: mpsc::Receiver<Job>) {
    let id = state.id();
    debug!(session = %id, "session task running");
    while let Some(job) = rx.recv().await {
        job(&mut state);
        if !state.is_active() {
            break;
        }
    }
    rx.close();
    debug!(session = %id, "session task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PrefixMerge;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(CollabConfig::default(), Arc::new(PrefixMerge))
    }

    #[tokio::test]
    async fn one_live_session_per_report() {
        let registry = registry();
        let report = ReportId::new();
        let (session, _) = registry
            .start(ReportDocument::new(report), HashMap::new(), None)
            .await
            .unwrap();

        let err = registry
            .start(ReportDocument::new(report), HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaborationError::AlreadyActive(r) if r == report));

        registry.end(&session.id, None).await.unwrap();
        assert!(registry.get(&session.id).await.is_err());
        assert!(registry
            .start(ReportDocument::new(report), HashMap::new(), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn requests_run_on_the_session_task() {
        let registry = registry();
        let (session, handle) = registry
            .start(ReportDocument::new(ReportId::new()), HashMap::new(), None)
            .await
            .unwrap();
        let id = handle.request(|s| s.id()).await.unwrap();
        assert_eq!(id, session.id);
        assert_eq!(registry.list().await.len(), 1);

        registry.shutdown().await;
        assert!(handle.request(|s| s.id()).await.is_err());
        assert!(registry.list().await.is_empty());
    }
}
