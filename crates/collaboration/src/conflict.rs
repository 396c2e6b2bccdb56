/// Conflict detection records and resolution policies
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{
    CollaborationError, FieldKey, OperationId, ParticipantId, ReportId, Result,
};

/// Conflict record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Types of conflicts that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two edits to the same field authored against the same version
    ConcurrentEdit,

    /// Causal token not found in the field history (ahead of the field or evicted)
    VersionMismatch,

    /// Edit arrived after the author's edit grant was revoked
    PermissionChange,
}

/// Conflict resolution policy of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The later-arriving edit is applied; the race is recorded for audit
    #[default]
    LastWriterWins,

    /// Run the pluggable merge function, fall back to manual
    Merge,

    /// Lock the field until a participant with approve rights picks a value
    Manual,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LastWriterWins => "last_writer_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        })
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = CollaborationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last_writer_wins" => Ok(Self::LastWriterWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(CollaborationError::ValidationFailure(format!(
                "unknown conflict resolution: {other}"
            ))),
        }
    }
}

/// One competing value for a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedValue {
    /// `None` for the field's initial value
    pub author: Option<ParticipantId>,
    pub operation_id: Option<OperationId>,
    pub value: String,
    pub proposed_at: chrono::DateTime<chrono::Utc>,
}

/// How a conflict was closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Closed by the session policy without user involvement
    Automatic { strategy: ResolutionStrategy },

    /// A participant picked one of the proposals
    Chosen { proposal: usize },

    /// A participant supplied merged content
    Merged,

    /// Overwritten by a version restore
    Restored,

    /// The edit was refused and the stored value kept
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// `None` when closed automatically
    pub resolver: Option<ParticipantId>,
    pub resolved_at: chrono::DateTime<chrono::Utc>,
    pub value: String,
    #[serde(flatten)]
    pub method: ResolutionMethod,
}

/// A detected race on one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub report_id: ReportId,
    pub field: FieldKey,
    pub kind: ConflictKind,

    /// Operation whose fate this record documents
    pub subject: OperationId,

    pub participants: Vec<ParticipantId>,
    pub proposals: Vec<ProposedValue>,
    pub detected_at: chrono::DateTime<chrono::Utc>,
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    pub fn new(
        report_id: ReportId,
        field: FieldKey,
        kind: ConflictKind,
        subject: OperationId,
        proposals: Vec<ProposedValue>,
    ) -> Self {
        let mut participants: Vec<ParticipantId> =
            proposals.iter().filter_map(|p| p.author).collect();
        participants.dedup();
        Self {
            id: ConflictId::new(),
            report_id,
            field,
            kind,
            subject,
            participants,
            proposals,
            detected_at: chrono::Utc::now(),
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Close the record; a record is closed exactly once
    pub fn close(&mut self, resolution: Resolution) -> Result<()> {
        if self.resolution.is_some() {
            return Err(CollaborationError::AlreadyResolved(format!(
                "conflict {}",
                self.id
            )));
        }
        self.resolution = Some(resolution);
        Ok(())
    }
}

/// Participant's decision for a manual conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Index into the record's proposals
    Proposal { index: usize },

    /// Hand-merged content
    Merged { content: String },
}

/// Pluggable merge function for the `merge` policy
pub trait MergeStrategy: Send + Sync {
    /// Merge the stored and incoming values, `None` if they cannot be merged
    fn merge(&self, field: &FieldKey, stored: &str, incoming: &str) -> Option<String>;
}

/// Never merges; `merge` sessions always escalate to manual resolution
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMerge;

impl MergeStrategy for NoMerge {
    fn merge(&self, _field: &FieldKey, _stored: &str, _incoming: &str) -> Option<String> {
        None
    }
}

/// Merges only when one value extends the other.
///
/// Identical values, or a value that is a prefix of the other (one author kept
/// typing where the other stopped), merge to the longer value. Anything else
/// is left to a human.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixMerge;

impl MergeStrategy for PrefixMerge {
    fn merge(&self, _field: &FieldKey, stored: &str, incoming: &str) -> Option<String> {
        if incoming.starts_with(stored) {
            Some(incoming.to_string())
        } else if stored.starts_with(incoming) {
            Some(stored.to_string())
        } else {
            None
        }
    }
}

/// What the resolver decided for a version mismatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Apply `value` to the field
    Apply {
        value: String,
        strategy: ResolutionStrategy,
    },

    /// Leave the field untouched and wait for a participant
    Escalate,
}

/// Applies a session's conflict policy
pub struct ConflictResolver {
    merger: std::sync::Arc<dyn MergeStrategy>,
}

impl ConflictResolver {
    pub fn new(merger: std::sync::Arc<dyn MergeStrategy>) -> Self {
        Self { merger }
    }

    /// Decide between the stored value and the incoming value
    pub fn decide(
        &self,
        strategy: ResolutionStrategy,
        field: &FieldKey,
        stored: &str,
        incoming: &str,
    ) -> Decision {
        match strategy {
            ResolutionStrategy::LastWriterWins => Decision::Apply {
                value: incoming.to_string(),
                strategy,
            },
            ResolutionStrategy::Manual => Decision::Escalate,
            ResolutionStrategy::Merge => match self.merger.merge(field, stored, incoming) {
                Some(value) => Decision::Apply { value, strategy },
                None => Decision::Escalate,
            },
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(std::sync::Arc::new(PrefixMerge))
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver").finish_non_exhaustive()
    }
}

/// Report-owned conflict log; records outlive the session that produced them
#[derive(Debug, Default)]
pub struct ConflictLog {
    records: HashMap<ConflictId, ConflictRecord>,
    by_report: HashMap<ReportId, Vec<ConflictId>>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ConflictRecord) {
        self.by_report
            .entry(record.report_id)
            .or_default()
            .push(record.id);
        self.records.insert(record.id, record);
    }

    pub fn get(&self, id: &ConflictId) -> Option<&ConflictRecord> {
        self.records.get(id)
    }

    /// Close a record in the log; fails if it is unknown or already closed
    pub fn close(&mut self, id: &ConflictId, resolution: Resolution) -> Result<ConflictRecord> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CollaborationError::NotFound(format!("conflict {id}")))?;
        record.close(resolution)?;
        Ok(record.clone())
    }

    /// Records for a report in detection order
    pub fn for_report(&self, report_id: &ReportId, unresolved_only: bool) -> Vec<ConflictRecord> {
        self.by_report
            .get(report_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .filter(|r| !unresolved_only || !r.is_resolved())
            .cloned()
            .collect()
    }
}
