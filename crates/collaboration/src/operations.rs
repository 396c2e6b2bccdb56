/// Field-level edit operations and the session replay log
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::{Field, FieldKey, FieldVersion, ParticipantId, Result, SessionId, TextEdit};

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An edit to one report field, as authored by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOperation {
    pub id: OperationId,
    pub session_id: SessionId,
    pub author: ParticipantId,

    /// Client time at authoring
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub target: FieldKey,

    #[serde(flatten)]
    pub edit: TextEdit,

    /// Field version the author had observed when producing this edit
    pub causal_token: FieldVersion,
}

impl EditOperation {
    pub fn new(
        session_id: SessionId,
        author: ParticipantId,
        target: FieldKey,
        edit: TextEdit,
        causal_token: FieldVersion,
    ) -> Self {
        Self {
            id: OperationId::new(),
            session_id,
            author,
            timestamp: chrono::Utc::now(),
            target,
            edit,
            causal_token,
        }
    }

    /// Payload checks that need no field state
    pub fn validate(&self) -> Result<()> {
        self.edit.validate()?;
        Ok(())
    }
}

/// An operation as applied by the pipeline, in authoritative order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEdit {
    pub operation: EditOperation,

    /// Field version after this edit
    pub version: FieldVersion,

    /// Position in the session replay log
    pub sequence: u64,

    /// Full field value, present when the edit replaced the field wholesale
    /// (conflict resolution, restore) rather than applying on the previous version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Field>,
}

/// Append-only replay log for one session
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: VecDeque<AppliedEdit>,

    /// Index by operation ID for fast lookup (sequence numbers)
    index: HashMap<OperationId, u64>,

    next_sequence: u64,
}

impl OperationLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            index: HashMap::new(),
            next_sequence: 1,
        }
    }

    /// Sequence number the next appended edit will receive
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.max(1)
    }

    /// Sequence of the newest entry, 0 when empty
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence().saturating_sub(1)
    }

    /// Append an operation, returning its sequence number
    pub fn append(
        &mut self,
        operation: EditOperation,
        version: FieldVersion,
        value: Option<Field>,
    ) -> AppliedEdit {
        let sequence = self.next_sequence();
        self.next_sequence = sequence + 1;
        self.index.insert(operation.id, sequence);
        let applied = AppliedEdit {
            operation,
            version,
            sequence,
            value,
        };
        self.entries.push_back(applied.clone());
        applied
    }

    pub fn get(&self, id: &OperationId) -> Option<&AppliedEdit> {
        let sequence = *self.index.get(id)?;
        let first = self.entries.front()?.sequence;
        let idx = sequence.checked_sub(first)?;
        self.entries.get(usize::try_from(idx).ok()?)
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.index.contains_key(id)
    }

    /// Entries with a sequence greater than `since`, oldest first
    pub fn since(&self, since: u64) -> Vec<AppliedEdit> {
        self.entries
            .iter()
            .filter(|e| e.sequence > since)
            .cloned()
            .collect()
    }

    /// Applied edits for one field, oldest first
    pub fn for_field(&self, key: &FieldKey) -> Vec<&AppliedEdit> {
        self.entries
            .iter()
            .filter(|e| &e.operation.target == key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest sequence still replayable, if any
    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.front().map(|e| e.sequence)
    }

    /// Drop the oldest entries so that at most `keep` remain.
    ///
    /// Clients that fall behind the retained window resynchronize from the
    /// full document sent on join.
    pub fn compact(&mut self, keep: usize) -> usize {
        if self.entries.len() <= keep {
            return 0;
        }
        let removed = self.entries.len() - keep;
        for entry in self.entries.drain(..removed) {
            self.index.remove(&entry.operation.id);
        }
        removed
    }
}
