/// Collaboration service
/// Explicitly constructed and shared by cloning; owns the session registry,
/// report-level stores and background tasks
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::record;
use crate::{
    Approval, ApprovalKind, AuditEvent, AuditSink, ClientMessage, CollabConfig, CollaborationError,
    Comment, CommentFilter, CommentId, CommentReply, CommentStore, ConflictChoice, ConflictId,
    ConflictLog, ConflictRecord, CursorPosition, EditOperation, FieldKey, FieldVersion,
    MemorySnapshotStore, MergeStrategy, NewApproval, NewComment, OutboundQueue, Participant,
    ParticipantId, ParticipantInfo, PermissionPatch, Permissions, PrefixMerge, ReportDocument,
    ReportId, Result, Role, ServerMessage, Session, SessionHandle, SessionId, SessionRegistry,
    SessionSummary, SettingsPatch, SnapshotRequest, SnapshotStore, SubmitOutcome, Timer,
    TokioTimer, TracingAuditSink, VersionId, VersionSnapshot, VersionStore, VersionSummary,
};

/// Pluggable collaborators of the service
#[derive(Clone)]
pub struct ServiceDeps {
    pub audit: Arc<dyn AuditSink>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub merger: Arc<dyn MergeStrategy>,
    pub timer: Arc<dyn Timer>,
}

impl Default for ServiceDeps {
    fn default() -> Self {
        Self {
            audit: Arc::new(TracingAuditSink),
            snapshots: Arc::new(MemorySnapshotStore::new()),
            merger: Arc::new(PrefixMerge),
            timer: Arc::new(TokioTimer),
        }
    }
}

struct Inner {
    config: CollabConfig,
    registry: SessionRegistry,
    versions: VersionStore,
    comments: Mutex<CommentStore>,
    conflicts: Mutex<ConflictLog>,
    audit: Arc<dyn AuditSink>,
    timer: Arc<dyn Timer>,
    /// Debounce generation per session; only the newest scheduled save runs
    autosave: Mutex<HashMap<SessionId, u64>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// A caller's standing in a session
struct Member {
    handle: SessionHandle,
    report_id: ReportId,
    permissions: Permissions,
    role: Role,
}

/// Per-connection routing state
#[derive(Debug, Clone)]
pub struct Connection {
    pub outbox: OutboundQueue,
    pub session: Option<SessionId>,
    pub participant: Option<ParticipantInfo>,
}

impl Connection {
    pub fn new(outbox: OutboundQueue) -> Self {
        Self {
            outbox,
            session: None,
            participant: None,
        }
    }

    fn bound(&self) -> Result<(SessionId, ParticipantId)> {
        match (&self.session, &self.participant) {
            (Some(session), Some(participant)) => Ok((*session, participant.id)),
            _ => Err(CollaborationError::ValidationFailure(
                "join a session first".into(),
            )),
        }
    }
}

#[derive(Clone)]
pub struct CollaborationService {
    inner: Arc<Inner>,
}

impl CollaborationService {
    /// Build the service and start its background presence sweep
    pub fn init(config: CollabConfig, deps: ServiceDeps) -> Self {
        let inner = Arc::new(Inner {
            registry: SessionRegistry::new(config.clone(), deps.merger.clone()),
            versions: VersionStore::new(deps.snapshots.clone()),
            comments: Mutex::new(CommentStore::new()),
            conflicts: Mutex::new(ConflictLog::new()),
            audit: deps.audit,
            timer: deps.timer,
            autosave: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            config,
        });
        if inner.config.presence_sweep_interval_secs > 0 {
            let sweeper = tokio::spawn(sweep_presence(Arc::downgrade(&inner)));
            *inner.sweeper.lock() = Some(sweeper);
        }
        info!("collaboration service started");
        Self { inner }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.inner.config
    }

    /// End every session and stop background work
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        self.inner.registry.shutdown().await;
        self.inner.autosave.lock().clear();
        info!("collaboration service stopped");
    }

    fn audit(&self, event: AuditEvent) {
        record(self.inner.audit.as_ref(), event);
    }

    async fn member(&self, session_id: SessionId, caller: ParticipantId) -> Result<Member> {
        let handle = self.inner.registry.get(&session_id).await?;
        let (report_id, permissions, role) = handle
            .request(move |s| {
                let permissions = s.member_permissions(&caller)?;
                let role = s.participant(&caller).map(|p| p.role).unwrap_or(Role::Viewer);
                Ok::<_, CollaborationError>((s.report_id(), permissions, role))
            })
            .await??;
        Ok(Member {
            handle,
            report_id,
            permissions,
            role,
        })
    }

    async fn broadcast(handle: &SessionHandle, message: ServerMessage) -> Result<()> {
        handle.request(move |s| s.broadcast(message, None)).await
    }

    // Session lifecycle

    pub async fn start_session(
        &self,
        document: ReportDocument,
        permissions: HashMap<ParticipantId, Permissions>,
    ) -> Result<Session> {
        let (session, _) = self
            .inner
            .registry
            .start(document, permissions, None)
            .await?;
        self.audit(AuditEvent::new(
            "session_started",
            "session",
            session.id,
            format!("collaboration session started for report {}", session.report_id),
        ));
        Ok(session)
    }

    /// End a session; `caller` must be an administrator, `None` ends it as the service
    pub async fn end_session(
        &self,
        session_id: SessionId,
        caller: Option<ParticipantId>,
    ) -> Result<()> {
        self.inner.registry.end(&session_id, caller).await?;
        self.inner.autosave.lock().remove(&session_id);
        self.audit(AuditEvent::new(
            "session_ended",
            "session",
            session_id,
            "collaboration session ended",
        ));
        Ok(())
    }

    pub async fn join(
        &self,
        session_id: SessionId,
        participant: ParticipantInfo,
        outbox: OutboundQueue,
    ) -> Result<Session> {
        let handle = self.inner.registry.get(&session_id).await?;
        let id = participant.id;
        let session = handle
            .request(move |s| s.join(participant, outbox, Utc::now()))
            .await??;
        self.audit(AuditEvent::new(
            "participant_joined",
            "session",
            session_id,
            format!("participant {id} joined"),
        ));
        Ok(session)
    }

    pub async fn leave(&self, session_id: SessionId, participant: ParticipantId) -> Result<()> {
        let handle = self.inner.registry.get(&session_id).await?;
        let (outcome, auto_save) = handle
            .request(move |s| {
                s.leave(&participant, Utc::now())
                    .map(|o| (o, s.settings().auto_save))
            })
            .await??;

        if outcome.last_online && auto_save {
            if let Err(e) = self
                .create_snapshot(session_id, None, "Auto-save: session idle".into())
                .await
            {
                warn!(session = %session_id, error = %e, "auto-save on idle failed");
            }
        }
        Ok(())
    }

    pub async fn update_permissions(
        &self,
        session_id: SessionId,
        caller: ParticipantId,
        target: ParticipantId,
        patch: PermissionPatch,
    ) -> Result<Session> {
        let handle = self.inner.registry.get(&session_id).await?;
        let session = handle
            .request(move |s| s.update_permissions(&caller, target, &patch))
            .await??;
        self.audit(
            AuditEvent::new(
                "permissions_updated",
                "session",
                session_id,
                format!("{caller} changed permissions of {target}"),
            )
            .with_metadata(serde_json::json!({ "patch": patch })),
        );
        Ok(session)
    }

    pub async fn update_settings(
        &self,
        session_id: SessionId,
        caller: ParticipantId,
        patch: SettingsPatch,
    ) -> Result<Session> {
        let handle = self.inner.registry.get(&session_id).await?;
        handle
            .request(move |s| s.update_settings(&caller, &patch))
            .await?
    }

    // Editing

    pub async fn submit(&self, operation: EditOperation) -> Result<SubmitOutcome> {
        let session_id = operation.session_id;
        let handle = self.inner.registry.get(&session_id).await?;
        let (outcome, auto_save) = handle
            .request(move |s| {
                s.submit(operation, Utc::now())
                    .map(|o| (o, s.settings().auto_save))
            })
            .await??;

        match &outcome {
            SubmitOutcome::Accepted { audit, .. } => {
                self.log_conflicts(audit);
                if auto_save {
                    self.schedule_autosave(session_id);
                }
            }
            SubmitOutcome::Rejected { audit, .. } => {
                if let Some(record) = audit {
                    self.log_conflicts(std::slice::from_ref(record));
                }
            }
            SubmitOutcome::Conflict(record) => {
                self.log_conflicts(std::slice::from_ref(record));
            }
        }
        Ok(outcome)
    }

    fn log_conflicts(&self, records: &[ConflictRecord]) {
        if records.is_empty() {
            return;
        }
        let mut log = self.inner.conflicts.lock();
        for record in records {
            log.insert(record.clone());
        }
        drop(log);
        for record in records {
            self.audit(
                AuditEvent::new(
                    "conflict_detected",
                    "conflict",
                    record.id,
                    format!("{:?} on {}", record.kind, record.field),
                )
                .with_metadata(serde_json::json!({
                    "report_id": record.report_id,
                    "resolved": record.is_resolved(),
                    "participants": record.participants,
                })),
            );
        }
    }

    /// Fire-and-forget; shed under load
    pub async fn update_cursor(
        &self,
        session_id: SessionId,
        participant: ParticipantId,
        position: CursorPosition,
        at: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        let handle = self.inner.registry.get(&session_id).await?;
        Ok(handle.notify(move |s| {
            s.update_cursor(&participant, position, at, Utc::now());
        }))
    }

    pub async fn touch(&self, session_id: SessionId, participant: ParticipantId) -> Result<()> {
        let handle = self.inner.registry.get(&session_id).await?;
        handle.notify(move |s| s.touch(&participant, Utc::now()));
        Ok(())
    }

    pub async fn resolve_conflict(
        &self,
        session_id: SessionId,
        caller: ParticipantId,
        conflict_id: ConflictId,
        choice: ConflictChoice,
    ) -> Result<ConflictRecord> {
        let closed = self
            .inner
            .conflicts
            .lock()
            .get(&conflict_id)
            .is_some_and(ConflictRecord::is_resolved);
        if closed {
            return Err(CollaborationError::AlreadyResolved(format!(
                "conflict {conflict_id}"
            )));
        }

        let handle = self.inner.registry.get(&session_id).await?;
        let (record, auto_save) = handle
            .request(move |s| {
                s.resolve_conflict(&caller, &conflict_id, choice, Utc::now())
                    .map(|(_, record)| (record, s.settings().auto_save))
            })
            .await??;
        self.close_logged(&record);
        self.audit(AuditEvent::new(
            "conflict_resolved",
            "conflict",
            conflict_id,
            format!("{caller} resolved conflict on {}", record.field),
        ));
        if auto_save {
            self.schedule_autosave(session_id);
        }
        Ok(record)
    }

    fn close_logged(&self, record: &ConflictRecord) {
        let Some(resolution) = record.resolution.clone() else {
            return;
        };
        if let Err(e) = self.inner.conflicts.lock().close(&record.id, resolution) {
            warn!(conflict = %record.id, error = %e, "conflict log out of step");
        }
    }

    pub fn conflicts(&self, report_id: &ReportId, unresolved_only: bool) -> Vec<ConflictRecord> {
        self.inner
            .conflicts
            .lock()
            .for_report(report_id, unresolved_only)
    }

    pub async fn sync(
        &self,
        session_id: SessionId,
        participant: ParticipantId,
        since: u64,
    ) -> Result<()> {
        let handle = self.inner.registry.get(&session_id).await?;
        handle
            .request(move |s| {
                let response = s.sync_since(since);
                s.send_to(&participant, response);
            })
            .await
    }

    // Comments and approvals

    pub async fn add_comment(
        &self,
        session_id: SessionId,
        author: ParticipantId,
        comment: NewComment,
    ) -> Result<Comment> {
        let member = self.member(session_id, author).await?;
        if !member.permissions.can_comment {
            return Err(CollaborationError::PermissionDenied(format!(
                "{author} cannot comment"
            )));
        }
        let comment = self
            .inner
            .comments
            .lock()
            .add(member.report_id, author, comment, Utc::now())?;
        Self::broadcast(
            &member.handle,
            ServerMessage::CommentAdded {
                comment: comment.clone(),
            },
        )
        .await?;
        self.audit(AuditEvent::new(
            "comment_added",
            "comment",
            comment.id,
            format!("{author} commented on report {}", member.report_id),
        ));
        Ok(comment)
    }

    pub async fn reply_comment(
        &self,
        session_id: SessionId,
        author: ParticipantId,
        comment_id: CommentId,
        body: String,
        mentions: Vec<ParticipantId>,
    ) -> Result<CommentReply> {
        let member = self.member(session_id, author).await?;
        if !member.permissions.can_comment {
            return Err(CollaborationError::PermissionDenied(format!(
                "{author} cannot comment"
            )));
        }
        let reply = self
            .inner
            .comments
            .lock()
            .reply(&member.report_id, &comment_id, author, body, mentions, Utc::now())?;
        Self::broadcast(
            &member.handle,
            ServerMessage::CommentReplied {
                comment_id,
                reply: reply.clone(),
            },
        )
        .await?;
        Ok(reply)
    }

    pub async fn resolve_comment(
        &self,
        session_id: SessionId,
        caller: ParticipantId,
        comment_id: CommentId,
    ) -> Result<Comment> {
        let member = self.member(session_id, caller).await?;
        if !member.permissions.can_comment {
            return Err(CollaborationError::PermissionDenied(format!(
                "{caller} cannot resolve comments"
            )));
        }
        let comment = self
            .inner
            .comments
            .lock()
            .resolve(&member.report_id, &comment_id, caller, Utc::now())?;
        Self::broadcast(
            &member.handle,
            ServerMessage::CommentResolved {
                comment: comment.clone(),
            },
        )
        .await?;
        self.audit(AuditEvent::new(
            "comment_resolved",
            "comment",
            comment_id,
            format!("{caller} resolved comment"),
        ));
        Ok(comment)
    }

    pub fn comments(&self, report_id: &ReportId, filter: &CommentFilter) -> Vec<Comment> {
        self.inner.comments.lock().list(report_id, filter)
    }

    pub async fn request_approval(
        &self,
        session_id: SessionId,
        caller: ParticipantId,
        approval: NewApproval,
    ) -> Result<Approval> {
        let member = self.member(session_id, caller).await?;
        if !member.permissions.can_comment {
            return Err(CollaborationError::PermissionDenied(format!(
                "{caller} cannot request approval"
            )));
        }
        let approval = self.inner.comments.lock().request_approval(
            member.report_id,
            caller,
            approval,
            Utc::now(),
        );
        Self::broadcast(
            &member.handle,
            ServerMessage::ApprovalRequested {
                approval: approval.clone(),
            },
        )
        .await?;
        self.audit(AuditEvent::new(
            "approval_requested",
            "approval",
            approval.id,
            format!("{caller} requested {:?} approval", approval.kind),
        ));
        Ok(approval)
    }

    pub async fn respond_approval(
        &self,
        session_id: SessionId,
        caller: ParticipantId,
        approval_id: CommentId,
        approved: bool,
        note: Option<String>,
    ) -> Result<Approval> {
        let member = self.member(session_id, caller).await?;
        let pending = self
            .inner
            .comments
            .lock()
            .approval(&member.report_id, &approval_id)
            .cloned()
            .ok_or_else(|| CollaborationError::NotFound(format!("approval {approval_id}")))?;

        let allowed = member.permissions.can_approve
            && (pending.kind != ApprovalKind::Sign || member.permissions.can_sign)
            && pending.addressed_to(caller, member.role);
        if !allowed {
            return Err(CollaborationError::PermissionDenied(format!(
                "{caller} cannot answer approval {approval_id}"
            )));
        }

        let approval = self.inner.comments.lock().respond_approval(
            &member.report_id,
            &approval_id,
            caller,
            approved,
            note,
            Utc::now(),
        )?;
        Self::broadcast(
            &member.handle,
            ServerMessage::ApprovalResponded {
                approval: approval.clone(),
            },
        )
        .await?;
        self.audit(AuditEvent::new(
            "approval_responded",
            "approval",
            approval_id,
            format!(
                "{caller} {} the request",
                if approved { "approved" } else { "rejected" }
            ),
        ));
        Ok(approval)
    }

    pub fn approvals(&self, report_id: &ReportId, pending_only: bool) -> Vec<Approval> {
        self.inner.comments.lock().approvals(report_id, pending_only)
    }

    // Version history

    /// Snapshot the live document; `None` as author marks an automatic save
    pub async fn create_snapshot(
        &self,
        session_id: SessionId,
        author: Option<ParticipantId>,
        description: String,
    ) -> Result<VersionSnapshot> {
        let handle = match author {
            Some(author) => {
                let member = self.member(session_id, author).await?;
                if !member.permissions.can_edit {
                    return Err(CollaborationError::PermissionDenied(format!(
                        "{author} cannot create snapshots"
                    )));
                }
                member.handle
            }
            None => self.inner.registry.get(&session_id).await?,
        };

        let (document, field_versions) = handle
            .request(|s| (s.document().clone(), s.field_versions()))
            .await?;
        let snapshot = self
            .inner
            .versions
            .create(SnapshotRequest {
                author,
                description,
                document,
                field_versions,
                restored_from: None,
            })
            .await?;
        Self::broadcast(
            &handle,
            ServerMessage::VersionCreated {
                version: VersionSummary::from(&snapshot),
            },
        )
        .await?;
        self.audit(AuditEvent::new(
            "snapshot_created",
            "report",
            snapshot.report_id,
            format!("version {} created", snapshot.version),
        ));
        Ok(snapshot)
    }

    /// Overwrite the live document with a stored version and record the restore as a new version
    pub async fn restore(
        &self,
        session_id: SessionId,
        caller: ParticipantId,
        version_id: VersionId,
    ) -> Result<VersionSnapshot> {
        let member = self.member(session_id, caller).await?;
        if !member.permissions.can_approve {
            return Err(CollaborationError::PermissionDenied(format!(
                "{caller} cannot restore versions"
            )));
        }
        let target = self
            .inner
            .versions
            .get(&member.report_id, &version_id)
            .await?;

        let document = target.document.clone();
        let (outcome, current, field_versions) = member
            .handle
            .request(move |s| {
                s.restore(&caller, version_id, &document, Utc::now())
                    .map(|o| (o, s.document().clone(), s.field_versions()))
            })
            .await??;
        for record in &outcome.closed {
            self.close_logged(record);
        }

        let snapshot = self
            .inner
            .versions
            .create(SnapshotRequest {
                author: Some(caller),
                description: format!("Restored version {}", target.version),
                document: current,
                field_versions,
                restored_from: Some(version_id),
            })
            .await?;
        Self::broadcast(
            &member.handle,
            ServerMessage::VersionCreated {
                version: VersionSummary::from(&snapshot),
            },
        )
        .await?;
        self.audit(AuditEvent::new(
            "version_restored",
            "report",
            member.report_id,
            format!("{caller} restored version {}", target.version),
        ));
        Ok(snapshot)
    }

    pub async fn history(&self, report_id: &ReportId) -> Result<Vec<VersionSnapshot>> {
        self.inner.versions.history(report_id).await
    }

    // Observable state

    pub async fn session(&self, session_id: SessionId) -> Result<Session> {
        let handle = self.inner.registry.get(&session_id).await?;
        handle.request(|s| s.snapshot()).await
    }

    /// Live document with its per-field versions
    pub async fn document(
        &self,
        session_id: SessionId,
    ) -> Result<(ReportDocument, BTreeMap<FieldKey, FieldVersion>)> {
        let handle = self.inner.registry.get(&session_id).await?;
        handle
            .request(|s| (s.document().clone(), s.field_versions()))
            .await
    }

    /// The live session of a report, if any
    pub async fn current_session(&self, report_id: &ReportId) -> Option<Session> {
        let handle = self.inner.registry.for_report(report_id).await?;
        handle.request(|s| s.snapshot()).await.ok()
    }

    pub async fn active_users(&self, session_id: SessionId) -> Result<Vec<Participant>> {
        let handle = self.inner.registry.get(&session_id).await?;
        handle.request(|s| s.active_users()).await
    }

    pub async fn user_permissions(
        &self,
        session_id: SessionId,
        participant: ParticipantId,
    ) -> Result<Permissions> {
        let handle = self.inner.registry.get(&session_id).await?;
        handle.request(move |s| s.permissions_of(&participant)).await
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        self.inner.registry.list().await
    }

    // Auto-save

    fn schedule_autosave(&self, session_id: SessionId) {
        let generation = {
            let mut pending = self.inner.autosave.lock();
            let generation = pending.entry(session_id).or_insert(0);
            *generation += 1;
            *generation
        };
        let service = self.clone();
        let delay = self.inner.config.autosave_debounce();
        tokio::spawn(async move {
            service.inner.timer.sleep(delay).await;
            let current = service.inner.autosave.lock().get(&session_id).copied();
            if current != Some(generation) {
                return;
            }
            match service
                .create_snapshot(session_id, None, "Auto-save".into())
                .await
            {
                Ok(snapshot) => {
                    debug!(session = %session_id, version = snapshot.version, "auto-saved")
                }
                Err(e) => debug!(session = %session_id, error = %e, "auto-save skipped"),
            }
        });
    }

    // Message routing

    /// Route one client message; replies and broadcasts go through outbound queues
    pub async fn handle_message(
        &self,
        conn: &mut Connection,
        message: ClientMessage,
    ) -> Result<()> {
        match message {
            ClientMessage::StartSession {
                report_id,
                document,
                permissions,
                participant,
            } => {
                let document = document.unwrap_or_else(|| ReportDocument::new(report_id));
                if document.report_id != report_id {
                    return Err(CollaborationError::ValidationFailure(format!(
                        "document belongs to report {}, not {report_id}",
                        document.report_id
                    )));
                }
                let session = self.start_session(document, permissions).await?;
                self.bind(conn, session.id, participant).await
            }
            ClientMessage::JoinSession {
                session_id,
                participant,
            } => self.bind(conn, session_id, participant).await,
            ClientMessage::LeaveSession => {
                let (session_id, participant) = conn.bound()?;
                conn.session = None;
                conn.participant = None;
                self.leave(session_id, participant).await
            }
            ClientMessage::EndSession => {
                let (session_id, participant) = conn.bound()?;
                self.end_session(session_id, Some(participant)).await
            }
            ClientMessage::UpdatePermissions {
                participant_id,
                patch,
            } => {
                let (session_id, caller) = conn.bound()?;
                self.update_permissions(session_id, caller, participant_id, patch)
                    .await
                    .map(drop)
            }
            ClientMessage::UpdateSettings { patch } => {
                let (session_id, caller) = conn.bound()?;
                self.update_settings(session_id, caller, patch)
                    .await
                    .map(drop)
            }
            ClientMessage::FieldChange { operation } => {
                let (session_id, caller) = conn.bound()?;
                if operation.author != caller || operation.session_id != session_id {
                    return Err(CollaborationError::PermissionDenied(
                        "operation author does not match connection".into(),
                    ));
                }
                self.submit(operation).await.map(drop)
            }
            ClientMessage::ResolveConflict { conflict_id, choice } => {
                let (session_id, caller) = conn.bound()?;
                self.resolve_conflict(session_id, caller, conflict_id, choice)
                    .await
                    .map(drop)
            }
            ClientMessage::SyncRequest { since } => {
                let (session_id, caller) = conn.bound()?;
                self.sync(session_id, caller, since).await
            }
            ClientMessage::CursorMove { position, at } => {
                let (session_id, caller) = conn.bound()?;
                self.update_cursor(session_id, caller, position, at)
                    .await
                    .map(drop)
            }
            ClientMessage::AddComment { comment } => {
                let (session_id, caller) = conn.bound()?;
                self.add_comment(session_id, caller, comment).await.map(drop)
            }
            ClientMessage::ReplyComment {
                comment_id,
                body,
                mentions,
            } => {
                let (session_id, caller) = conn.bound()?;
                self.reply_comment(session_id, caller, comment_id, body, mentions)
                    .await
                    .map(drop)
            }
            ClientMessage::ResolveComment { comment_id } => {
                let (session_id, caller) = conn.bound()?;
                self.resolve_comment(session_id, caller, comment_id)
                    .await
                    .map(drop)
            }
            ClientMessage::RequestApproval { approval } => {
                let (session_id, caller) = conn.bound()?;
                self.request_approval(session_id, caller, approval)
                    .await
                    .map(drop)
            }
            ClientMessage::RespondApproval {
                approval_id,
                approved,
                note,
            } => {
                let (session_id, caller) = conn.bound()?;
                self.respond_approval(session_id, caller, approval_id, approved, note)
                    .await
                    .map(drop)
            }
            ClientMessage::CreateSnapshot { description } => {
                let (session_id, caller) = conn.bound()?;
                self.create_snapshot(session_id, Some(caller), description)
                    .await
                    .map(drop)
            }
            ClientMessage::RestoreVersion { version_id } => {
                let (session_id, caller) = conn.bound()?;
                self.restore(session_id, caller, version_id).await.map(drop)
            }
            ClientMessage::Ping => {
                if let Ok((session_id, caller)) = conn.bound() {
                    self.touch(session_id, caller).await?;
                }
                conn.outbox.send(ServerMessage::Pong);
                Ok(())
            }
        }
    }

    async fn bind(
        &self,
        conn: &mut Connection,
        session_id: SessionId,
        participant: ParticipantInfo,
    ) -> Result<()> {
        if let Ok((current, id)) = conn.bound() {
            if current != session_id || id != participant.id {
                self.leave(current, id).await?;
            }
        }
        self.join(session_id, participant.clone(), conn.outbox.clone())
            .await?;
        conn.session = Some(session_id);
        conn.participant = Some(participant);
        Ok(())
    }

    /// Connection dropped; the participant goes offline and may rejoin
    pub async fn disconnect(&self, conn: &mut Connection) {
        if let Ok((session_id, participant)) = conn.bound() {
            if let Err(e) = self.leave(session_id, participant).await {
                debug!(session = %session_id, error = %e, "leave on disconnect failed");
            }
        }
        conn.session = None;
        conn.participant = None;
        conn.outbox.close();
    }
}

impl std::fmt::Debug for CollaborationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Periodically marks idle participants offline; stops with the service
async fn sweep_presence(inner: Weak<Inner>) {
    loop {
        let (timer, interval) = match inner.upgrade() {
            Some(inner) => (inner.timer.clone(), inner.config.presence_sweep_interval()),
            None => return,
        };
        timer.sleep(interval).await;
        // an immediate timer must not starve the runtime
        tokio::task::yield_now().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let idle_after = inner.config.idle_timeout();
        for handle in inner.registry.handles().await {
            match handle
                .request(move |s| s.sweep_idle(Utc::now(), idle_after))
                .await
            {
                Ok(swept) if !swept.is_empty() => {
                    debug!(session = %handle.id(), count = swept.len(), "presence swept");
                }
                Ok(_) => {}
                Err(e) => debug!(session = %handle.id(), error = %e, "sweep skipped"),
            }
        }
    }
}
