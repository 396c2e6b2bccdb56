/// Session state owned by the session's single writer task
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    AppliedEdit, CollabConfig, CollaborationError, ConflictChoice, ConflictId, ConflictRecord,
    CursorPosition, Delivery, EditGrant, EditOperation, EditPipeline, FieldKey, FieldVersion,
    MergeStrategy, OutboundQueue, Participant, ParticipantId, ParticipantInfo, PermissionPatch,
    Permissions, ReportDocument, ReportId, ResolutionStrategy, RestoreOutcome, Result,
    ServerMessage, SessionId, SubmitOutcome, VersionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    #[default]
    All,
    Mentions,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub conflict_resolution: ResolutionStrategy,
    pub auto_save: bool,
    pub notification_level: NotificationLevel,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            conflict_resolution: ResolutionStrategy::LastWriterWins,
            auto_save: true,
            notification_level: NotificationLevel::All,
        }
    }
}

/// Partial settings update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub conflict_resolution: Option<ResolutionStrategy>,
    pub auto_save: Option<bool>,
    pub notification_level: Option<NotificationLevel>,
}

impl SessionSettings {
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(v) = patch.conflict_resolution {
            self.conflict_resolution = v;
        }
        if let Some(v) = patch.auto_save {
            self.auto_save = v;
        }
        if let Some(v) = patch.notification_level {
            self.notification_level = v;
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub report_id: ReportId,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub participants: Vec<Participant>,
    pub permissions: HashMap<ParticipantId, Permissions>,
    pub settings: SessionSettings,
}

impl Session {
    /// Grants of a participant; default-deny for strangers
    pub fn permissions_of(&self, participant: &ParticipantId) -> Permissions {
        self.permissions
            .get(participant)
            .copied()
            .unwrap_or_else(Permissions::none)
    }

    pub fn online(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.online)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub report_id: ReportId,
    pub created_at: DateTime<Utc>,
    pub participants: usize,
    pub online: usize,
}

/// Result of a participant leaving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub was_online: bool,
    /// Nobody is online anymore
    pub last_online: bool,
}

/// Mutable state of one session. Only the session task touches it.
pub struct SessionState {
    id: SessionId,
    report_id: ReportId,
    created_at: DateTime<Utc>,
    active: bool,
    participants: Vec<Participant>,
    permissions: HashMap<ParticipantId, Permissions>,
    /// Participants whose edit grant was withdrawn during the session
    revoked: HashSet<ParticipantId>,
    settings: SessionSettings,
    presence: crate::PresenceTracker,
    pipeline: EditPipeline,
    outboxes: HashMap<ParticipantId, OutboundQueue>,
}

impl SessionState {
    pub fn new(
        id: SessionId,
        document: ReportDocument,
        permissions: HashMap<ParticipantId, Permissions>,
        settings: SessionSettings,
        merger: Arc<dyn MergeStrategy>,
        config: &CollabConfig,
    ) -> Self {
        let report_id = document.report_id;
        Self {
            id,
            report_id,
            created_at: Utc::now(),
            active: true,
            participants: Vec::new(),
            permissions,
            revoked: HashSet::new(),
            settings,
            presence: crate::PresenceTracker::new(),
            pipeline: EditPipeline::new(
                id,
                document,
                merger,
                config.field_history_depth,
                config.max_log_entries,
            ),
            outboxes: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn report_id(&self) -> ReportId {
        self.report_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> Session {
        Session {
            id: self.id,
            report_id: self.report_id,
            created_at: self.created_at,
            active: self.active,
            participants: self.participants.clone(),
            permissions: self.permissions.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            report_id: self.report_id,
            created_at: self.created_at,
            participants: self.participants.len(),
            online: self.presence.online_count(),
        }
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    fn participant_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.id == id)
    }

    pub fn permissions_of(&self, id: &ParticipantId) -> Permissions {
        self.permissions
            .get(id)
            .copied()
            .unwrap_or_else(Permissions::none)
    }

    /// Grants of a session member; strangers are refused outright
    pub fn member_permissions(&self, id: &ParticipantId) -> Result<Permissions> {
        if self.participant(id).is_none() {
            return Err(CollaborationError::PermissionDenied(format!(
                "{id} is not a participant of session {}",
                self.id
            )));
        }
        Ok(self.permissions_of(id))
    }

    pub fn active_users(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| p.online)
            .cloned()
            .collect()
    }

    pub fn document(&self) -> &ReportDocument {
        self.pipeline.document()
    }

    pub fn field_versions(&self) -> BTreeMap<FieldKey, FieldVersion> {
        self.pipeline.field_versions()
    }

    pub fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.pipeline.unresolved()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(CollaborationError::NotFound(format!(
                "session {} is not active",
                self.id
            )))
        }
    }

    /// Add or reactivate a participant and attach their outbound queue
    pub fn join(
        &mut self,
        info: ParticipantInfo,
        outbox: OutboundQueue,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        self.ensure_active()?;

        let rejoin = self.participant(&info.id).is_some();
        match self.participant_mut(&info.id) {
            Some(existing) => {
                existing.name = info.name.clone();
                existing.online = true;
                existing.last_seen = now;
            }
            None => {
                let mut participant = Participant::new(info.id, info.name.clone(), info.role);
                participant.online = true;
                participant.last_seen = now;
                self.participants.push(participant);
            }
        }
        self.permissions
            .entry(info.id)
            .or_insert_with(|| info.role.default_permissions());
        self.presence.mark_online(info.id, now);

        if let Some(previous) = self.outboxes.insert(info.id, outbox.clone()) {
            // a second connection for the same participant takes over
            if !previous.same_queue(&outbox) {
                previous.close();
            }
        }

        let session = self.snapshot();
        outbox.send(ServerMessage::SessionJoined {
            session: session.clone(),
            participant_id: info.id,
            document: self.pipeline.document().clone(),
            field_versions: self.pipeline.field_versions(),
            conflicts: self.pipeline.unresolved(),
            last_sequence: self.pipeline.log().last_sequence(),
        });

        if let Some(participant) = self.participant(&info.id).cloned() {
            self.broadcast(ServerMessage::UserJoined { participant }, Some(info.id));
        }
        info!(session = %self.id, participant = %info.id, rejoin, "participant joined");
        Ok(session)
    }

    /// Mark a participant offline; they stay listed for history
    pub fn leave(&mut self, id: &ParticipantId, now: DateTime<Utc>) -> Result<LeaveOutcome> {
        let participant = self
            .participant_mut(id)
            .ok_or_else(|| CollaborationError::NotFound(format!("participant {id}")))?;
        participant.online = false;
        participant.last_seen = now;
        participant.focus = None;

        let was_online = self.presence.mark_offline(id, now);
        // detached only; the connection may join again
        self.outboxes.remove(id);
        if was_online {
            self.broadcast(ServerMessage::UserLeft { participant_id: *id }, None);
        }
        let last_online = self.presence.online_count() == 0;
        info!(session = %self.id, participant = %id, last_online, "participant left");
        Ok(LeaveOutcome {
            was_online,
            last_online,
        })
    }

    pub fn touch(&mut self, id: &ParticipantId, now: DateTime<Utc>) {
        self.presence.touch(id, now);
        if let Some(p) = self.participant_mut(id) {
            p.last_seen = now;
        }
    }

    /// Run one edit through the pipeline and fan out the result
    pub fn submit(
        &mut self,
        operation: EditOperation,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        self.ensure_active()?;
        if operation.session_id != self.id {
            return Err(CollaborationError::ValidationFailure(format!(
                "operation {} targets session {}, not {}",
                operation.id, operation.session_id, self.id
            )));
        }
        let author = operation.author;
        let permissions = self.member_permissions(&author)?;
        let grant = if permissions.can_edit {
            EditGrant::Allowed
        } else if self.revoked.contains(&author) {
            EditGrant::Revoked
        } else {
            EditGrant::Denied
        };
        self.touch(&author, now);

        let operation_id = operation.id;
        let key = operation.target.clone();
        let outcome = self
            .pipeline
            .submit(operation, grant, self.settings.conflict_resolution, now);

        match &outcome {
            SubmitOutcome::Accepted { applied, audit } => {
                debug!(
                    session = %self.id,
                    field = %key,
                    version = applied.version,
                    raced = !audit.is_empty(),
                    "edit applied"
                );
                // A rewritten edit must reach its author too: their local copy diverged
                let except = applied.value.is_none().then_some(author);
                self.broadcast(
                    ServerMessage::RealtimeEdit {
                        edit: applied.clone(),
                    },
                    except,
                );
                self.send_to(
                    &author,
                    ServerMessage::EditAck {
                        operation_id,
                        version: applied.version,
                        sequence: applied.sequence,
                    },
                );
            }
            SubmitOutcome::Rejected { reason, .. } => {
                debug!(session = %self.id, field = %key, ?reason, "edit rejected");
                let error = reason.clone().into_error(&key);
                self.send_to(
                    &author,
                    ServerMessage::EditRejected {
                        operation_id,
                        error: (&error).into(),
                    },
                );
            }
            SubmitOutcome::Conflict(record) => {
                info!(
                    session = %self.id,
                    field = %key,
                    conflict = %record.id,
                    "conflict escalated"
                );
                self.broadcast(
                    ServerMessage::ConflictDetected {
                        conflict: record.clone(),
                    },
                    None,
                );
            }
        }
        Ok(outcome)
    }

    /// Most-recent-wins cursor update; returns whether it was rebroadcast
    pub fn update_cursor(
        &mut self,
        id: &ParticipantId,
        position: CursorPosition,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.presence.update_cursor(id, position.clone(), at, now) {
            return false;
        }
        if let Some(p) = self.participant_mut(id) {
            p.focus = Some(position.clone());
            p.last_seen = now;
        }
        self.broadcast(
            ServerMessage::CursorMoved {
                participant_id: *id,
                position,
            },
            Some(*id),
        );
        true
    }

    pub fn resolve_conflict(
        &mut self,
        caller: &ParticipantId,
        conflict_id: &ConflictId,
        choice: ConflictChoice,
        now: DateTime<Utc>,
    ) -> Result<(AppliedEdit, ConflictRecord)> {
        self.ensure_active()?;
        if !self.member_permissions(caller)?.can_approve {
            return Err(CollaborationError::PermissionDenied(format!(
                "{caller} cannot resolve conflicts"
            )));
        }
        let (applied, record) = self.pipeline.resolve(conflict_id, *caller, choice, now)?;
        self.broadcast(
            ServerMessage::RealtimeEdit {
                edit: applied.clone(),
            },
            None,
        );
        self.broadcast(
            ServerMessage::ConflictResolved {
                conflict: record.clone(),
            },
            None,
        );
        Ok((applied, record))
    }

    fn require_admin(&self, caller: &ParticipantId) -> Result<()> {
        match self.participant(caller) {
            Some(p) if p.role.can_administer() => Ok(()),
            _ => Err(CollaborationError::PermissionDenied(format!(
                "{caller} cannot administer session {}",
                self.id
            ))),
        }
    }

    pub fn update_permissions(
        &mut self,
        caller: &ParticipantId,
        target: ParticipantId,
        patch: &PermissionPatch,
    ) -> Result<Session> {
        self.ensure_active()?;
        self.require_admin(caller)?;
        let role = self
            .participant(&target)
            .map(|p| p.role)
            .ok_or_else(|| CollaborationError::NotFound(format!("participant {target}")))?;

        let grants = self
            .permissions
            .entry(target)
            .or_insert_with(|| role.default_permissions());
        let could_edit = grants.can_edit;
        grants.apply(patch);
        if could_edit && !grants.can_edit {
            self.revoked.insert(target);
        } else if grants.can_edit {
            self.revoked.remove(&target);
        }

        let session = self.snapshot();
        self.broadcast(
            ServerMessage::SessionUpdated {
                session: session.clone(),
            },
            None,
        );
        Ok(session)
    }

    pub fn update_settings(
        &mut self,
        caller: &ParticipantId,
        patch: &crate::SettingsPatch,
    ) -> Result<Session> {
        self.ensure_active()?;
        self.require_admin(caller)?;
        self.settings.apply(patch);
        let session = self.snapshot();
        self.broadcast(
            ServerMessage::SessionUpdated {
                session: session.clone(),
            },
            None,
        );
        Ok(session)
    }

    /// Overwrite the live document with a snapshot's content
    pub fn restore(
        &mut self,
        caller: &ParticipantId,
        version_id: VersionId,
        document: &ReportDocument,
        now: DateTime<Utc>,
    ) -> Result<RestoreOutcome> {
        self.ensure_active()?;
        let outcome = self.pipeline.restore(document, *caller, now);
        self.broadcast(
            ServerMessage::DocumentRestored {
                version_id,
                document: self.pipeline.document().clone(),
                field_versions: self.pipeline.field_versions(),
            },
            None,
        );
        for record in &outcome.closed {
            self.broadcast(
                ServerMessage::ConflictResolved {
                    conflict: record.clone(),
                },
                None,
            );
        }
        info!(
            session = %self.id,
            %version_id,
            changed = outcome.applied.len(),
            removed = outcome.removed.len(),
            "document restored"
        );
        Ok(outcome)
    }

    /// Applied edits after `since` for a client catching up
    pub fn sync_since(&self, since: u64) -> ServerMessage {
        let log = self.pipeline.log();
        let complete = match log.first_sequence() {
            Some(first) => since + 1 >= first,
            None => since >= log.last_sequence(),
        };
        ServerMessage::SyncResponse {
            edits: log.since(since),
            last_sequence: log.last_sequence(),
            complete,
        }
    }

    /// Mark idle participants offline and disconnect them
    pub fn sweep_idle(&mut self, now: DateTime<Utc>, idle_after: Duration) -> Vec<ParticipantId> {
        let idle = self.presence.sweep_idle(now, idle_after);
        for id in &idle {
            if let Some(p) = self.participant_mut(id) {
                p.online = false;
                p.focus = None;
            }
            if let Some(outbox) = self.outboxes.remove(id) {
                outbox.close();
            }
            self.broadcast(ServerMessage::UserLeft { participant_id: *id }, None);
        }
        if !idle.is_empty() {
            info!(session = %self.id, count = idle.len(), "swept idle participants");
        }
        idle
    }

    /// Deactivate the session and disconnect everyone
    pub fn end(&mut self, caller: Option<&ParticipantId>) -> Result<()> {
        self.ensure_active()?;
        if let Some(caller) = caller {
            self.require_admin(caller)?;
        }
        self.active = false;
        self.broadcast(ServerMessage::SessionEnded { session_id: self.id }, None);
        for (_, outbox) in self.outboxes.drain() {
            outbox.close();
        }
        let now = Utc::now();
        for p in &mut self.participants {
            if p.online {
                p.online = false;
                p.last_seen = now;
            }
        }
        info!(session = %self.id, report = %self.report_id, "session ended");
        Ok(())
    }

    pub fn send_to(&self, id: &ParticipantId, message: ServerMessage) {
        if let Some(outbox) = self.outboxes.get(id) {
            outbox.send(message);
        }
    }

    /// Fan out to every connected participant except `except`
    pub fn broadcast(&self, message: ServerMessage, except: Option<ParticipantId>) {
        let delivery = Delivery::for_message(&message);
        for (id, outbox) in &self.outboxes {
            if Some(*id) == except {
                continue;
            }
            outbox.push(message.clone(), delivery.clone());
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("report_id", &self.report_id)
            .field("active", &self.active)
            .field("participants", &self.participants.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PrefixMerge, Role, TextEdit};

    fn info(name: &str, role: Role) -> ParticipantInfo {
        ParticipantInfo {
            id: ParticipantId::new(),
            name: name.into(),
            role,
        }
    }

    fn state() -> SessionState {
        state_with(&CollabConfig::default())
    }

    fn state_with(config: &CollabConfig) -> SessionState {
        let doc = ReportDocument::from_fields(
            ReportId::new(),
            [(FieldKey::new("findings", "text"), "")],
        );
        SessionState::new(
            SessionId::new(),
            doc,
            HashMap::new(),
            SessionSettings::default(),
            Arc::new(PrefixMerge),
            config,
        )
    }

    fn drain(queue: &OutboundQueue) -> Vec<ServerMessage> {
        std::iter::from_fn(|| queue.try_pop()).collect()
    }

    #[test]
    fn join_sends_state_and_announces() {
        let mut s = state();
        let now = Utc::now();
        let (alice, bob) = (info("alice", Role::Attending), info("bob", Role::Resident));
        let (qa, qb) = (OutboundQueue::new(8), OutboundQueue::new(8));

        s.join(alice.clone(), qa.clone(), now).unwrap();
        let session = s.join(bob.clone(), qb.clone(), now).unwrap();
        assert_eq!(session.participants.len(), 2);
        assert!(session.permissions_of(&bob.id).can_edit);
        assert!(!session.permissions_of(&ParticipantId::new()).can_edit);

        let to_alice = drain(&qa);
        assert_eq!(to_alice[0].type_name(), "session_joined");
        assert!(matches!(
            &to_alice[1],
            ServerMessage::UserJoined { participant } if participant.id == bob.id
        ));
        assert_eq!(drain(&qb).len(), 1);
    }

    #[test]
    fn rejoin_reactivates_instead_of_duplicating() {
        let mut s = state();
        let now = Utc::now();
        let alice = info("alice", Role::Attending);
        s.join(alice.clone(), OutboundQueue::new(8), now).unwrap();
        let outcome = s.leave(&alice.id, now).unwrap();
        assert!(outcome.was_online && outcome.last_online);

        let session = s.join(alice.clone(), OutboundQueue::new(8), now).unwrap();
        assert_eq!(session.participants.len(), 1);
        assert!(session.participants[0].online);
    }

    #[test]
    fn second_connection_takes_over_outbox() {
        let mut s = state();
        let now = Utc::now();
        let alice = info("alice", Role::Attending);
        let (first, second) = (OutboundQueue::new(8), OutboundQueue::new(8));
        s.join(alice.clone(), first.clone(), now).unwrap();
        s.join(alice.clone(), first.clone(), now).unwrap();
        assert!(!first.is_closed());

        s.join(alice.clone(), second.clone(), now).unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[test]
    fn admin_only_updates_and_revocation_is_audited() {
        let mut s = state();
        let now = Utc::now();
        let (admin, resident) = (info("a", Role::Attending), info("r", Role::Resident));
        s.join(admin.clone(), OutboundQueue::new(8), now).unwrap();
        s.join(resident.clone(), OutboundQueue::new(8), now).unwrap();

        let revoke = PermissionPatch {
            can_edit: Some(false),
            ..Default::default()
        };
        assert!(matches!(
            s.update_permissions(&resident.id, admin.id, &revoke),
            Err(CollaborationError::PermissionDenied(_))
        ));
        s.update_permissions(&admin.id, resident.id, &revoke).unwrap();

        let op = EditOperation::new(
            s.id(),
            resident.id,
            FieldKey::new("findings", "text"),
            TextEdit::Insert {
                position: 0,
                content: "x".into(),
            },
            0,
        );
        match s.submit(op, now).unwrap() {
            SubmitOutcome::Rejected { audit: Some(record), .. } => {
                assert_eq!(record.kind, crate::ConflictKind::PermissionChange)
            }
            other => panic!("expected audited rejection, got {other:?}"),
        }
    }

    #[test]
    fn ended_session_refuses_joins() {
        let mut s = state();
        let admin = info("a", Role::Admin);
        let queue = OutboundQueue::new(8);
        s.join(admin.clone(), queue.clone(), Utc::now()).unwrap();
        s.end(Some(&admin.id)).unwrap();
        assert!(queue.is_closed());
        assert!(matches!(
            s.join(info("late", Role::Viewer), OutboundQueue::new(8), Utc::now()),
            Err(CollaborationError::NotFound(_))
        ));
    }

    #[test]
    fn sync_reports_incomplete_after_compaction() {
        let mut s = state_with(&CollabConfig {
            max_log_entries: 2,
            ..CollabConfig::default()
        });
        let now = Utc::now();
        let alice = info("alice", Role::Attending);
        s.join(alice.clone(), OutboundQueue::new(8), now).unwrap();
        let key = FieldKey::new("findings", "text");
        for version in 0..4 {
            let op = EditOperation::new(
                s.id(),
                alice.id,
                key.clone(),
                TextEdit::Insert {
                    position: 0,
                    content: "a".into(),
                },
                version,
            );
            s.submit(op, now).unwrap();
        }

        match s.sync_since(0) {
            ServerMessage::SyncResponse {
                edits,
                last_sequence,
                complete,
            } => {
                let sequences: Vec<u64> = edits.iter().map(|e| e.sequence).collect();
                assert_eq!(sequences, vec![3, 4]);
                assert_eq!(last_sequence, 4);
                assert!(!complete);
            }
            other => panic!("unexpected {other:?}"),
        }
        match s.sync_since(2) {
            ServerMessage::SyncResponse { edits, complete, .. } => {
                assert_eq!(edits.len(), 2);
                assert!(complete);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
