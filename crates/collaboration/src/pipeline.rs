/// Edit propagation pipeline
/// Orders edits per field, detects races via causal tokens and applies the
/// session's conflict policy
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    AppliedEdit, CollaborationError, ConflictChoice, ConflictId, ConflictKind, ConflictRecord,
    ConflictResolver, Decision, EditOperation, Field, FieldKey, FieldVersion, MergeStrategy,
    OperationId, OperationLog, ParticipantId, ProposedValue, ReportDocument, Resolution,
    ResolutionMethod, ResolutionStrategy, Result, SessionId, TextEdit,
};

/// A field value as of one version
#[derive(Debug, Clone)]
pub struct FieldRevision {
    pub version: FieldVersion,
    pub value: Field,
    pub operation: Option<OperationId>,
    pub author: Option<ParticipantId>,
    pub applied_at: DateTime<Utc>,
    /// Already documented by a last-writer-wins audit record
    raced: bool,
}

/// Version bookkeeping for one field key
#[derive(Debug, Clone)]
pub struct FieldState {
    pub version: FieldVersion,
    pub last_operation: Option<OperationId>,
    history: VecDeque<FieldRevision>,
}

impl FieldState {
    fn new(initial: Field, now: DateTime<Utc>) -> Self {
        let mut history = VecDeque::new();
        history.push_back(FieldRevision {
            version: 0,
            value: initial,
            operation: None,
            author: None,
            applied_at: now,
            raced: false,
        });
        Self {
            version: 0,
            last_operation: None,
            history,
        }
    }

    fn revision(&self, version: FieldVersion) -> Option<&FieldRevision> {
        self.history.iter().find(|r| r.version == version)
    }

    fn latest(&self) -> Option<&FieldRevision> {
        self.history.back()
    }

    fn push(&mut self, revision: FieldRevision, depth: usize) {
        self.version = revision.version;
        self.last_operation = revision.operation;
        self.history.push_back(revision);
        while self.history.len() > depth.max(1) {
            self.history.pop_front();
        }
    }
}

/// Whether the author may edit, as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditGrant {
    Allowed,
    Denied,
    /// Denied because the grant was withdrawn while the author was in the session
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    PermissionDenied,
    FieldLocked { conflict_id: ConflictId },
    Duplicate,
    Invalid(String),
}

impl RejectReason {
    pub fn into_error(self, key: &FieldKey) -> CollaborationError {
        match self {
            Self::PermissionDenied => {
                CollaborationError::PermissionDenied(format!("cannot edit {key}"))
            }
            Self::FieldLocked { conflict_id } => CollaborationError::ValidationFailure(format!(
                "{key} is locked by unresolved conflict {conflict_id}"
            )),
            Self::Duplicate => {
                CollaborationError::ValidationFailure(format!("duplicate operation on {key}"))
            }
            Self::Invalid(reason) => CollaborationError::ValidationFailure(reason),
        }
    }
}

/// Result of submitting one edit
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Applied; `audit` holds already-resolved records of any race that was settled automatically
    Accepted {
        applied: AppliedEdit,
        audit: Vec<ConflictRecord>,
    },

    Rejected {
        reason: RejectReason,
        audit: Option<ConflictRecord>,
    },

    /// Escalated to manual resolution; the field is locked
    Conflict(ConflictRecord),
}

/// Changes made by overwriting the document with a snapshot
#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub applied: Vec<AppliedEdit>,
    pub removed: Vec<FieldKey>,
    pub closed: Vec<ConflictRecord>,
}

#[derive(Debug, Clone)]
struct PendingConflict {
    record: ConflictRecord,
    /// Field values matching `record.proposals`, index for index
    candidates: Vec<Field>,
}

/// Authoritative document state of one session
#[derive(Debug)]
pub struct EditPipeline {
    session_id: SessionId,
    document: ReportDocument,
    fields: HashMap<FieldKey, FieldState>,
    log: OperationLog,
    locks: HashMap<FieldKey, ConflictId>,
    pending: HashMap<ConflictId, PendingConflict>,
    closed: HashSet<ConflictId>,
    resolver: ConflictResolver,
    history_depth: usize,
    max_log_entries: usize,
}

impl EditPipeline {
    pub fn new(
        session_id: SessionId,
        document: ReportDocument,
        merger: Arc<dyn MergeStrategy>,
        history_depth: usize,
        max_log_entries: usize,
    ) -> Self {
        Self {
            session_id,
            document,
            fields: HashMap::new(),
            log: OperationLog::new(),
            locks: HashMap::new(),
            pending: HashMap::new(),
            closed: HashSet::new(),
            resolver: ConflictResolver::new(merger),
            history_depth,
            max_log_entries,
        }
    }

    pub fn document(&self) -> &ReportDocument {
        &self.document
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn version(&self, key: &FieldKey) -> FieldVersion {
        self.fields.get(key).map(|s| s.version).unwrap_or(0)
    }

    /// Current version of every field that has one, plus untouched document fields at 0
    pub fn field_versions(&self) -> BTreeMap<FieldKey, FieldVersion> {
        let mut versions: BTreeMap<FieldKey, FieldVersion> =
            self.document.fields().map(|(key, _)| (key, 0)).collect();
        for (key, state) in &self.fields {
            versions.insert(key.clone(), state.version);
        }
        versions
    }

    pub fn lock_holder(&self, key: &FieldKey) -> Option<ConflictId> {
        self.locks.get(key).copied()
    }

    pub fn unresolved(&self) -> Vec<ConflictRecord> {
        self.pending.values().map(|p| p.record.clone()).collect()
    }

    fn state_mut(&mut self, key: &FieldKey, now: DateTime<Utc>) -> &mut FieldState {
        let initial = self.document.field(key).cloned().unwrap_or_default();
        self.fields
            .entry(key.clone())
            .or_insert_with(|| FieldState::new(initial, now))
    }

    /// Submit an edit in arrival order
    pub fn submit(
        &mut self,
        operation: EditOperation,
        grant: EditGrant,
        strategy: ResolutionStrategy,
        now: DateTime<Utc>,
    ) -> SubmitOutcome {
        let key = operation.target.clone();

        match grant {
            EditGrant::Allowed => {}
            EditGrant::Denied => return reject(RejectReason::PermissionDenied),
            EditGrant::Revoked => {
                let record = self.permission_change_record(&operation, now);
                return SubmitOutcome::Rejected {
                    reason: RejectReason::PermissionDenied,
                    audit: Some(record),
                };
            }
        }

        if let Err(e) = operation.validate() {
            return reject(RejectReason::Invalid(e.to_string()));
        }
        if self.log.contains(&operation.id) {
            return reject(RejectReason::Duplicate);
        }
        if let Some(conflict_id) = self.locks.get(&key) {
            return reject(RejectReason::FieldLocked {
                conflict_id: *conflict_id,
            });
        }

        let current = self.state_mut(&key, now).version;
        if operation.causal_token == current {
            return self.apply_in_order(operation, now);
        }

        self.resolve_race(operation, strategy, now)
    }

    /// Common case: the author saw the latest version
    fn apply_in_order(&mut self, operation: EditOperation, now: DateTime<Utc>) -> SubmitOutcome {
        let key = operation.target.clone();
        let mut value = self.document.field(&key).cloned().unwrap_or_default();
        if let Err(e) = operation.edit.apply(&key, &mut value) {
            return reject(RejectReason::Invalid(e.to_string()));
        }
        let applied = self.commit(operation, value, None, now);
        SubmitOutcome::Accepted {
            applied,
            audit: Vec::new(),
        }
    }

    fn resolve_race(
        &mut self,
        operation: EditOperation,
        strategy: ResolutionStrategy,
        now: DateTime<Utc>,
    ) -> SubmitOutcome {
        let key = operation.target.clone();
        let state = self.state_mut(&key, now);
        let current_version = state.version;

        let (kind, base) = match state.revision(operation.causal_token) {
            Some(rev) if operation.causal_token < current_version => {
                (ConflictKind::ConcurrentEdit, rev.value.clone())
            }
            _ => (
                ConflictKind::VersionMismatch,
                state.latest().map(|r| r.value.clone()).unwrap_or_default(),
            ),
        };
        let stored = state
            .latest()
            .map(|r| r.value.clone())
            .unwrap_or_default();

        let mut incoming = base;
        if let Err(e) = operation.edit.apply(&key, &mut incoming) {
            return reject(RejectReason::Invalid(e.to_string()));
        }

        debug!(
            field = %key,
            author = %operation.author,
            causal_token = operation.causal_token,
            version = current_version,
            ?kind,
            %strategy,
            "edit raced"
        );

        let stored_proposal = {
            let latest = state.latest();
            ProposedValue {
                author: latest.and_then(|r| r.author),
                operation_id: latest.and_then(|r| r.operation),
                value: stored.text.clone(),
                proposed_at: latest.map(|r| r.applied_at).unwrap_or(now),
            }
        };
        let incoming_proposal = ProposedValue {
            author: Some(operation.author),
            operation_id: Some(operation.id),
            value: incoming.text.clone(),
            proposed_at: operation.timestamp,
        };

        let decision = self
            .resolver
            .decide(strategy, &key, &stored.text, &incoming.text);

        match decision {
            Decision::Apply { value, strategy } => {
                let resolved = if value == incoming.text {
                    incoming
                } else if value == stored.text {
                    stored.clone()
                } else {
                    Field::new(value)
                };

                // Each earlier edit that raced with this one gets its own record
                let mut audit = Vec::new();
                if let Some(state) = self.fields.get_mut(&key) {
                    for rev in state
                        .history
                        .iter_mut()
                        .filter(|r| r.version > operation.causal_token && !r.raced)
                    {
                        rev.raced = true;
                        let (Some(author), Some(op_id)) = (rev.author, rev.operation) else {
                            continue;
                        };
                        let proposal = ProposedValue {
                            author: Some(author),
                            operation_id: Some(op_id),
                            value: rev.value.text.clone(),
                            proposed_at: rev.applied_at,
                        };
                        audit.push(auto_resolved(
                            self.document.report_id,
                            &key,
                            kind,
                            op_id,
                            vec![proposal, incoming_proposal.clone()],
                            &resolved.text,
                            strategy,
                            now,
                        ));
                    }
                }
                audit.push(auto_resolved(
                    self.document.report_id,
                    &key,
                    kind,
                    operation.id,
                    vec![stored_proposal, incoming_proposal],
                    &resolved.text,
                    strategy,
                    now,
                ));

                let rewritten = EditOperation {
                    edit: TextEdit::replace_all(&stored, resolved.text.clone()),
                    ..operation
                };
                let applied = self.commit(rewritten, resolved.clone(), Some(resolved), now);
                if let Some(state) = self.fields.get_mut(&key) {
                    if let Some(rev) = state.history.back_mut() {
                        rev.raced = true;
                    }
                }
                SubmitOutcome::Accepted { applied, audit }
            }
            Decision::Escalate => {
                let record = ConflictRecord::new(
                    self.document.report_id,
                    key.clone(),
                    kind,
                    operation.id,
                    vec![stored_proposal, incoming_proposal],
                );
                self.locks.insert(key, record.id);
                self.pending.insert(
                    record.id,
                    PendingConflict {
                        record: record.clone(),
                        candidates: vec![stored, incoming],
                    },
                );
                SubmitOutcome::Conflict(record)
            }
        }
    }

    /// Close a manual conflict with a participant's choice and apply it as a new edit
    pub fn resolve(
        &mut self,
        conflict_id: &ConflictId,
        resolver: ParticipantId,
        choice: ConflictChoice,
        now: DateTime<Utc>,
    ) -> Result<(AppliedEdit, ConflictRecord)> {
        if self.closed.contains(conflict_id) {
            return Err(CollaborationError::AlreadyResolved(format!(
                "conflict {conflict_id}"
            )));
        }
        let pending = self
            .pending
            .get(conflict_id)
            .ok_or_else(|| CollaborationError::NotFound(format!("conflict {conflict_id}")))?;

        let (value, method) = match choice {
            ConflictChoice::Proposal { index } => {
                let field = pending.candidates.get(index).cloned().ok_or_else(|| {
                    CollaborationError::ValidationFailure(format!(
                        "conflict {conflict_id} has no proposal {index}"
                    ))
                })?;
                (field, ResolutionMethod::Chosen { proposal: index })
            }
            ConflictChoice::Merged { content } => (Field::new(content), ResolutionMethod::Merged),
        };

        let Some(mut pending) = self.pending.remove(conflict_id) else {
            return Err(CollaborationError::NotFound(format!("conflict {conflict_id}")));
        };
        let key = pending.record.field.clone();
        self.locks.remove(&key);
        self.closed.insert(*conflict_id);

        pending.record.close(Resolution {
            resolver: Some(resolver),
            resolved_at: now,
            value: value.text.clone(),
            method,
        })?;

        let current = self.document.field(&key).cloned().unwrap_or_default();
        let operation = EditOperation {
            id: OperationId::new(),
            session_id: self.session_id,
            author: resolver,
            timestamp: now,
            target: key.clone(),
            edit: TextEdit::replace_all(&current, value.text.clone()),
            causal_token: self.version(&key),
        };
        let applied = self.commit(operation, value.clone(), Some(value), now);
        Ok((applied, pending.record))
    }

    /// Overwrite the document with `target`, bypassing conflict resolution.
    ///
    /// Every changed field gets a version bump so stale client tokens are detected.
    pub fn restore(
        &mut self,
        target: &ReportDocument,
        author: ParticipantId,
        now: DateTime<Utc>,
    ) -> RestoreOutcome {
        let mut outcome = RestoreOutcome::default();

        for (key, field) in target.fields() {
            if self.document.field(&key) == Some(field) {
                continue;
            }
            let current = self.document.field(&key).cloned().unwrap_or_default();
            self.state_mut(&key, now);
            let operation = EditOperation {
                id: OperationId::new(),
                session_id: self.session_id,
                author,
                timestamp: now,
                target: key.clone(),
                edit: TextEdit::replace_all(&current, field.text.clone()),
                causal_token: self.version(&key),
            };
            let applied = self.commit(operation, field.clone(), Some(field.clone()), now);
            outcome.applied.push(applied);
            outcome.closed.extend(self.release_lock(&key, author, &field.text, now));
        }

        let extra: Vec<FieldKey> = self
            .document
            .fields()
            .map(|(key, _)| key)
            .filter(|key| target.field(key).is_none())
            .collect();
        for key in extra {
            let depth = self.history_depth;
            let state = self.state_mut(&key, now);
            let version = state.version + 1;
            state.push(
                FieldRevision {
                    version,
                    value: Field::default(),
                    operation: None,
                    author: Some(author),
                    applied_at: now,
                    raced: false,
                },
                depth,
            );
            if let Err(e) = self.document.remove_field(&key) {
                warn!(field = %key, error = %e, "restore could not remove field");
            }
            outcome.closed.extend(self.release_lock(&key, author, "", now));
            outcome.removed.push(key);
        }

        // Sections emptied by the restore disappear with it
        self.document
            .sections
            .retain(|id, section| !section.fields.is_empty() || target.sections.contains_key(id));
        for (id, section) in &target.sections {
            if let Some(ours) = self.document.sections.get_mut(id) {
                ours.title = section.title.clone();
            } else {
                self.document.sections.insert(id.clone(), section.clone());
            }
        }

        outcome
    }

    fn release_lock(
        &mut self,
        key: &FieldKey,
        author: ParticipantId,
        value: &str,
        now: DateTime<Utc>,
    ) -> Option<ConflictRecord> {
        let conflict_id = self.locks.remove(key)?;
        let mut pending = self.pending.remove(&conflict_id)?;
        self.closed.insert(conflict_id);
        let closed = pending.record.close(Resolution {
            resolver: Some(author),
            resolved_at: now,
            value: value.to_string(),
            method: ResolutionMethod::Restored,
        });
        match closed {
            Ok(()) => Some(pending.record),
            Err(e) => {
                warn!(conflict = %conflict_id, error = %e, "conflict closed twice");
                None
            }
        }
    }

    fn commit(
        &mut self,
        operation: EditOperation,
        value: Field,
        full_value: Option<Field>,
        now: DateTime<Utc>,
    ) -> AppliedEdit {
        let key = operation.target.clone();
        let depth = self.history_depth;
        self.document.set_field(&key, value.clone());

        let state = self.state_mut(&key, now);
        let version = state.version + 1;
        state.push(
            FieldRevision {
                version,
                value,
                operation: Some(operation.id),
                author: Some(operation.author),
                applied_at: now,
                raced: false,
            },
            depth,
        );

        let applied = self.log.append(operation, version, full_value);
        if self.log.len() > self.max_log_entries {
            let dropped = self.log.compact(self.max_log_entries);
            debug!(dropped, "compacted operation log");
        }
        applied
    }

    fn permission_change_record(
        &self,
        operation: &EditOperation,
        now: DateTime<Utc>,
    ) -> ConflictRecord {
        let stored = self.document.field_text(&operation.target).to_string();
        let mut record = ConflictRecord::new(
            self.document.report_id,
            operation.target.clone(),
            ConflictKind::PermissionChange,
            operation.id,
            vec![ProposedValue {
                author: Some(operation.author),
                operation_id: Some(operation.id),
                value: stored.clone(),
                proposed_at: operation.timestamp,
            }],
        );
        record.resolution = Some(Resolution {
            resolver: None,
            resolved_at: now,
            value: stored,
            method: ResolutionMethod::Rejected,
        });
        record
    }
}

fn reject(reason: RejectReason) -> SubmitOutcome {
    SubmitOutcome::Rejected {
        reason,
        audit: None,
    }
}

#[allow(clippy::too_many_arguments)]
fn auto_resolved(
    report_id: crate::ReportId,
    key: &FieldKey,
    kind: ConflictKind,
    subject: OperationId,
    proposals: Vec<ProposedValue>,
    value: &str,
    strategy: ResolutionStrategy,
    now: DateTime<Utc>,
) -> ConflictRecord {
    let mut record = ConflictRecord::new(report_id, key.clone(), kind, subject, proposals);
    record.resolution = Some(Resolution {
        resolver: None,
        resolved_at: now,
        value: value.to_string(),
        method: ResolutionMethod::Automatic { strategy },
    });
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PrefixMerge, ReportId};

    fn findings() -> FieldKey {
        FieldKey::new("findings", "text")
    }

    fn pipeline() -> EditPipeline {
        let doc = ReportDocument::from_fields(ReportId::new(), [(findings(), "")]);
        EditPipeline::new(SessionId::new(), doc, Arc::new(PrefixMerge), 8, 100)
    }

    fn insert(
        author: ParticipantId,
        key: FieldKey,
        text: &str,
        token: FieldVersion,
    ) -> EditOperation {
        EditOperation::new(
            SessionId::new(),
            author,
            key,
            TextEdit::Insert {
                position: 0,
                content: text.into(),
            },
            token,
        )
    }

    fn accept(outcome: SubmitOutcome) -> (AppliedEdit, Vec<ConflictRecord>) {
        match outcome {
            SubmitOutcome::Accepted { applied, audit } => (applied, audit),
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn in_order_edits_bump_version() {
        let mut p = pipeline();
        let a = ParticipantId::new();
        let now = Utc::now();

        let (first, audit) = accept(p.submit(
            insert(a, findings(), "normal", 0),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            now,
        ));
        assert!(audit.is_empty());
        assert_eq!(first.version, 1);
        assert!(first.value.is_none());

        let (second, _) = accept(p.submit(
            insert(a, findings(), "No ", 1),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            now,
        ));
        assert_eq!(second.version, 2);
        assert_eq!(p.document().field_text(&findings()), "No normal");
    }

    #[test]
    fn manual_race_locks_field() {
        let mut p = pipeline();
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        let now = Utc::now();

        accept(p.submit(
            insert(a, findings(), "normal", 0),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            now,
        ));
        let record = match p.submit(
            insert(b, findings(), "abnormal", 0),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            now,
        ) {
            SubmitOutcome::Conflict(record) => record,
            other => panic!("expected conflict, got {other:?}"),
        };
        assert_eq!(record.kind, ConflictKind::ConcurrentEdit);
        assert_eq!(record.proposals[0].value, "normal");
        assert_eq!(record.proposals[1].value, "abnormal");
        assert_eq!(p.version(&findings()), 1);

        // locked until resolved
        let blocked = p.submit(
            insert(a, findings(), "x", 1),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            now,
        );
        assert!(matches!(
            blocked,
            SubmitOutcome::Rejected { reason: RejectReason::FieldLocked { .. }, .. }
        ));

        let (applied, closed) = p
            .resolve(&record.id, a, ConflictChoice::Proposal { index: 1 }, now)
            .unwrap();
        assert_eq!(applied.version, 2);
        assert_eq!(applied.value.as_ref().unwrap().text, "abnormal");
        assert!(closed.is_resolved());
        assert_eq!(p.document().field_text(&findings()), "abnormal");
        assert!(p.lock_holder(&findings()).is_none());

        let again = p.resolve(&record.id, a, ConflictChoice::Proposal { index: 0 }, now);
        assert!(matches!(again, Err(CollaborationError::AlreadyResolved(_))));
    }

    #[test]
    fn last_writer_wins_audits_both_writers() {
        let mut p = pipeline();
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        let now = Utc::now();

        let (first, audit) = accept(p.submit(
            insert(a, findings(), "normal", 0),
            EditGrant::Allowed,
            ResolutionStrategy::LastWriterWins,
            now,
        ));
        assert!(audit.is_empty());
        let (second, audit) = accept(p.submit(
            insert(b, findings(), "abnormal", 0),
            EditGrant::Allowed,
            ResolutionStrategy::LastWriterWins,
            now,
        ));
        assert_eq!((first.version, second.version), (1, 2));
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(ConflictRecord::is_resolved));
        assert_eq!(p.document().field_text(&findings()), "abnormal");
    }

    #[test]
    fn merge_extends_or_escalates() {
        let mut p = pipeline();
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        let now = Utc::now();

        accept(p.submit(
            insert(a, findings(), "No acute", 0),
            EditGrant::Allowed,
            ResolutionStrategy::Merge,
            now,
        ));
        // b typed the same prefix and kept going
        let extended = EditOperation::new(
            SessionId::new(),
            b,
            findings(),
            TextEdit::Insert {
                position: 0,
                content: "No acute findings".into(),
            },
            0,
        );
        let (applied, audit) = accept(p.submit(
            extended,
            EditGrant::Allowed,
            ResolutionStrategy::Merge,
            now,
        ));
        assert_eq!(applied.version, 2);
        assert_eq!(audit.len(), 2);
        assert_eq!(p.document().field_text(&findings()), "No acute findings");

        let diverging = insert(a, findings(), "Fracture", 1);
        assert!(matches!(
            p.submit(diverging, EditGrant::Allowed, ResolutionStrategy::Merge, now),
            SubmitOutcome::Conflict(_)
        ));
    }

    #[test]
    fn token_ahead_is_version_mismatch() {
        let mut p = pipeline();
        let a = ParticipantId::new();
        let outcome = p.submit(
            insert(a, findings(), "x", 7),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            Utc::now(),
        );
        match outcome {
            SubmitOutcome::Conflict(record) => {
                assert_eq!(record.kind, ConflictKind::VersionMismatch)
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn revoked_editor_leaves_audit_record() {
        let mut p = pipeline();
        let outcome = p.submit(
            insert(ParticipantId::new(), findings(), "x", 0),
            EditGrant::Revoked,
            ResolutionStrategy::Manual,
            Utc::now(),
        );
        match outcome {
            SubmitOutcome::Rejected { reason, audit: Some(record) } => {
                assert_eq!(reason, RejectReason::PermissionDenied);
                assert_eq!(record.kind, ConflictKind::PermissionChange);
                assert!(record.is_resolved());
            }
            other => panic!("expected rejection with audit, got {other:?}"),
        }
        assert_eq!(p.version(&findings()), 0);
    }

    #[test]
    fn invalid_edit_is_rejected_without_mutation() {
        let mut p = pipeline();
        let op = EditOperation::new(
            SessionId::new(),
            ParticipantId::new(),
            findings(),
            TextEdit::Delete {
                position: 3,
                length: 2,
            },
            0,
        );
        assert!(matches!(
            p.submit(op, EditGrant::Allowed, ResolutionStrategy::Manual, Utc::now()),
            SubmitOutcome::Rejected { reason: RejectReason::Invalid(_), .. }
        ));
        assert_eq!(p.version(&findings()), 0);
    }

    #[test]
    fn restore_overwrites_and_bumps_versions() {
        let mut p = pipeline();
        let a = ParticipantId::new();
        let now = Utc::now();
        let snapshot = p.document().clone();

        let extra = FieldKey::new("impression", "summary");
        accept(p.submit(
            insert(a, findings(), "normal", 0),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            now,
        ));
        accept(p.submit(
            insert(a, extra.clone(), "fine", 0),
            EditGrant::Allowed,
            ResolutionStrategy::Manual,
            now,
        ));

        let outcome = p.restore(&snapshot, a, now);
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.removed, vec![extra.clone()]);
        assert_eq!(p.document(), &snapshot);
        assert_eq!(p.version(&findings()), 2);
        assert_eq!(p.version(&extra), 2);
    }
}
