/// Threaded comments and role-gated approvals
/// Anchored to a report section or field, independent of the live edit stream
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{CollaborationError, FieldKey, ParticipantId, ReportId, Result, Role, SectionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub uuid::Uuid);

impl CommentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CommentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a comment points. Anchors are annotations, not tied to field versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "anchor", rename_all = "snake_case")]
pub enum CommentAnchor {
    Report,
    Section { section: SectionId },
    Field {
        key: FieldKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<TextRange>,
    },
}

impl CommentAnchor {
    pub fn section(&self) -> Option<&SectionId> {
        match self {
            Self::Report => None,
            Self::Section { section } => Some(section),
            Self::Field { key, .. } => Some(&key.section),
        }
    }

    pub fn field(&self) -> Option<&FieldKey> {
        match self {
            Self::Field { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Char range inside a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentReply {
    pub id: CommentId,
    pub author: ParticipantId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub mentions: Vec<ParticipantId>,
}

/// Content of a new comment as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComment {
    pub anchor: CommentAnchor,
    pub body: String,
    #[serde(default)]
    pub mentions: Vec<ParticipantId>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub report_id: ReportId,
    pub anchor: CommentAnchor,
    pub author: ParticipantId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_by: Option<ParticipantId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub replies: Vec<CommentReply>,
    pub mentions: Vec<ParticipantId>,
    pub attachments: Vec<Attachment>,
}

/// Filters for listing comments; empty filter lists everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentFilter {
    pub resolved: Option<bool>,
    pub section: Option<SectionId>,
    pub field: Option<FieldKey>,
    pub author: Option<ParticipantId>,
    pub mentions: Option<ParticipantId>,
}

impl CommentFilter {
    pub fn matches(&self, comment: &Comment) -> bool {
        self.resolved.map_or(true, |r| comment.resolved == r)
            && self
                .section
                .as_ref()
                .map_or(true, |s| comment.anchor.section() == Some(s))
            && self
                .field
                .as_ref()
                .map_or(true, |f| comment.anchor.field() == Some(f))
            && self.author.map_or(true, |a| comment.author == a)
            && self.mentions.map_or(true, |m| {
                comment.mentions.contains(&m)
                    || comment.replies.iter().any(|r| r.mentions.contains(&m))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Content review; needs approve rights
    Review,
    /// Final sign-off; needs sign rights as well
    Sign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Who an approval request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum ApprovalTarget {
    Role { role: Role },
    Participant { id: ParticipantId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApproval {
    pub kind: ApprovalKind,
    pub target: ApprovalTarget,
    #[serde(default)]
    pub field: Option<FieldKey>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: CommentId,
    pub report_id: ReportId,
    pub kind: ApprovalKind,
    pub target: ApprovalTarget,
    pub field: Option<FieldKey>,
    pub note: Option<String>,
    pub requested_by: ParticipantId,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub responded_by: Option<ParticipantId>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_note: Option<String>,
}

impl Approval {
    /// Whether a participant with `role` may answer this request
    pub fn addressed_to(&self, participant: ParticipantId, role: Role) -> bool {
        match self.target {
            ApprovalTarget::Role { role: wanted } => wanted == role,
            ApprovalTarget::Participant { id } => id == participant,
        }
    }
}

/// Report-owned comment threads and approvals
#[derive(Debug, Default)]
pub struct CommentStore {
    comments: HashMap<CommentId, Comment>,
    approvals: HashMap<CommentId, Approval>,
    /// Insertion order per report
    order: HashMap<ReportId, Vec<CommentId>>,
}

impl CommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        report_id: ReportId,
        author: ParticipantId,
        new: NewComment,
        now: DateTime<Utc>,
    ) -> Result<Comment> {
        if new.body.trim().is_empty() {
            return Err(CollaborationError::ValidationFailure(
                "comment body is empty".into(),
            ));
        }
        if let CommentAnchor::Field {
            range: Some(range), ..
        } = &new.anchor
        {
            if range.start > range.end {
                return Err(CollaborationError::ValidationFailure(format!(
                    "comment range {}..{} is reversed",
                    range.start, range.end
                )));
            }
        }

        let comment = Comment {
            id: CommentId::new(),
            report_id,
            anchor: new.anchor,
            author,
            body: new.body,
            created_at: now,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            replies: Vec::new(),
            mentions: new.mentions,
            attachments: new.attachments,
        };
        self.order.entry(report_id).or_default().push(comment.id);
        self.comments.insert(comment.id, comment.clone());
        Ok(comment)
    }

    pub fn get(&self, id: &CommentId) -> Option<&Comment> {
        self.comments.get(id)
    }

    /// Threads of other reports are reported as missing
    fn comment_mut(&mut self, report_id: &ReportId, id: &CommentId) -> Result<&mut Comment> {
        self.comments
            .get_mut(id)
            .filter(|c| &c.report_id == report_id)
            .ok_or_else(|| CollaborationError::NotFound(format!("comment {id}")))
    }

    /// Replies are allowed on resolved threads
    pub fn reply(
        &mut self,
        report_id: &ReportId,
        id: &CommentId,
        author: ParticipantId,
        body: String,
        mentions: Vec<ParticipantId>,
        now: DateTime<Utc>,
    ) -> Result<CommentReply> {
        if body.trim().is_empty() {
            return Err(CollaborationError::ValidationFailure(
                "reply body is empty".into(),
            ));
        }
        let comment = self.comment_mut(report_id, id)?;
        let reply = CommentReply {
            id: CommentId::new(),
            author,
            body,
            created_at: now,
            mentions,
        };
        comment.replies.push(reply.clone());
        Ok(reply)
    }

    pub fn resolve(
        &mut self,
        report_id: &ReportId,
        id: &CommentId,
        resolver: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<Comment> {
        let comment = self.comment_mut(report_id, id)?;
        if comment.resolved {
            return Err(CollaborationError::AlreadyResolved(format!("comment {id}")));
        }
        comment.resolved = true;
        comment.resolved_by = Some(resolver);
        comment.resolved_at = Some(now);
        Ok(comment.clone())
    }

    /// Comments of a report in creation order
    pub fn list(&self, report_id: &ReportId, filter: &CommentFilter) -> Vec<Comment> {
        self.order
            .get(report_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.comments.get(id))
            .filter(|c| filter.matches(c))
            .cloned()
            .collect()
    }

    pub fn request_approval(
        &mut self,
        report_id: ReportId,
        requested_by: ParticipantId,
        new: NewApproval,
        now: DateTime<Utc>,
    ) -> Approval {
        let approval = Approval {
            id: CommentId::new(),
            report_id,
            kind: new.kind,
            target: new.target,
            field: new.field,
            note: new.note,
            requested_by,
            requested_at: now,
            status: ApprovalStatus::Pending,
            responded_by: None,
            responded_at: None,
            response_note: None,
        };
        self.approvals.insert(approval.id, approval.clone());
        approval
    }

    pub fn approval(&self, report_id: &ReportId, id: &CommentId) -> Option<&Approval> {
        self.approvals.get(id).filter(|a| &a.report_id == report_id)
    }

    /// Answer a pending approval; rights are checked by the caller
    pub fn respond_approval(
        &mut self,
        report_id: &ReportId,
        id: &CommentId,
        responder: ParticipantId,
        approved: bool,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Approval> {
        let approval = self
            .approvals
            .get_mut(id)
            .filter(|a| &a.report_id == report_id)
            .ok_or_else(|| CollaborationError::NotFound(format!("approval {id}")))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(CollaborationError::AlreadyResolved(format!("approval {id}")));
        }
        approval.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        approval.responded_by = Some(responder);
        approval.responded_at = Some(now);
        approval.response_note = note;
        Ok(approval.clone())
    }

    pub fn approvals(&self, report_id: &ReportId, pending_only: bool) -> Vec<Approval> {
        let mut out: Vec<Approval> = self
            .approvals
            .values()
            .filter(|a| &a.report_id == report_id)
            .filter(|a| !pending_only || a.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.requested_at);
        out
    }
}
