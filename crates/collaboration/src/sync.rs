/// WebSocket message protocol for real-time report collaboration
/// Every frame is a JSON envelope `{ "type": ..., "payload": { ... } }`
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{
    AppliedEdit, Approval, CollaborationError, Comment, CommentId, CommentReply, ConflictChoice,
    ConflictId, ConflictRecord, CursorPosition, EditOperation, FieldKey, FieldVersion, NewApproval,
    NewComment, OperationId, Participant, ParticipantId, PermissionPatch, Permissions,
    ReportDocument, ReportId, Result, Role, Session, SessionId, SettingsPatch, VersionId,
    VersionSnapshot,
};

/// Identity a client presents on join; authentication happens upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    // Session lifecycle
    #[serde(rename = "start_session")]
    StartSession {
        report_id: ReportId,
        #[serde(default)]
        document: Option<ReportDocument>,
        #[serde(default)]
        permissions: HashMap<ParticipantId, Permissions>,
        participant: ParticipantInfo,
    },

    #[serde(rename = "join_session")]
    JoinSession {
        session_id: SessionId,
        participant: ParticipantInfo,
    },

    #[serde(rename = "leave_session")]
    LeaveSession,

    #[serde(rename = "end_session")]
    EndSession,

    #[serde(rename = "update_permissions")]
    UpdatePermissions {
        participant_id: ParticipantId,
        patch: PermissionPatch,
    },

    #[serde(rename = "update_settings")]
    UpdateSettings { patch: SettingsPatch },

    // Editing
    #[serde(rename = "field_change")]
    FieldChange { operation: EditOperation },

    #[serde(rename = "resolve_conflict")]
    ResolveConflict {
        conflict_id: ConflictId,
        choice: ConflictChoice,
    },

    #[serde(rename = "sync_request")]
    SyncRequest { since: u64 },

    // Presence
    #[serde(rename = "cursor_move")]
    CursorMove {
        position: CursorPosition,
        at: DateTime<Utc>,
    },

    // Comments and approvals
    #[serde(rename = "add_comment")]
    AddComment { comment: NewComment },

    #[serde(rename = "reply_comment")]
    ReplyComment {
        comment_id: CommentId,
        body: String,
        #[serde(default)]
        mentions: Vec<ParticipantId>,
    },

    #[serde(rename = "resolve_comment")]
    ResolveComment { comment_id: CommentId },

    #[serde(rename = "request_approval")]
    RequestApproval { approval: NewApproval },

    #[serde(rename = "respond_approval")]
    RespondApproval {
        approval_id: CommentId,
        approved: bool,
        #[serde(default)]
        note: Option<String>,
    },

    // Version history
    #[serde(rename = "create_snapshot")]
    CreateSnapshot { description: String },

    #[serde(rename = "restore_version")]
    RestoreVersion { version_id: VersionId },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            CollaborationError::ValidationFailure(format!("malformed client message: {e}"))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Presence traffic; never queued for replay after a reconnect
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::CursorMove { .. } | Self::Ping)
    }
}

/// Wire form of a snapshot without the document body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub report_id: ReportId,
    pub version: u64,
    pub author: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub changes: usize,
    pub restored_from: Option<VersionId>,
}

impl From<&VersionSnapshot> for VersionSummary {
    fn from(s: &VersionSnapshot) -> Self {
        Self {
            id: s.id,
            report_id: s.report_id,
            version: s.version,
            author: s.author,
            created_at: s.created_at,
            description: s.description.clone(),
            changes: s.changes.len(),
            restored_from: s.restored_from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&CollaborationError> for ErrorBody {
    fn from(e: &CollaborationError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    // Session lifecycle
    #[serde(rename = "session_joined")]
    SessionJoined {
        session: Session,
        participant_id: ParticipantId,
        document: ReportDocument,
        field_versions: BTreeMap<FieldKey, FieldVersion>,
        conflicts: Vec<ConflictRecord>,
        last_sequence: u64,
    },

    #[serde(rename = "user_joined")]
    UserJoined { participant: Participant },

    #[serde(rename = "user_left")]
    UserLeft { participant_id: ParticipantId },

    #[serde(rename = "session_updated")]
    SessionUpdated { session: Session },

    #[serde(rename = "session_ended")]
    SessionEnded { session_id: SessionId },

    // Editing
    #[serde(rename = "realtime_edit")]
    RealtimeEdit { edit: AppliedEdit },

    #[serde(rename = "edit_ack")]
    EditAck {
        operation_id: OperationId,
        version: FieldVersion,
        sequence: u64,
    },

    #[serde(rename = "edit_rejected")]
    EditRejected {
        operation_id: OperationId,
        error: ErrorBody,
    },

    #[serde(rename = "conflict_detected")]
    ConflictDetected { conflict: ConflictRecord },

    #[serde(rename = "conflict_resolved")]
    ConflictResolved { conflict: ConflictRecord },

    #[serde(rename = "sync_response")]
    SyncResponse {
        edits: Vec<AppliedEdit>,
        last_sequence: u64,
        /// False when older edits were compacted away; the client must rejoin
        complete: bool,
    },

    // Presence
    #[serde(rename = "cursor_moved")]
    CursorMoved {
        participant_id: ParticipantId,
        position: CursorPosition,
    },

    // Comments and approvals
    #[serde(rename = "comment_added")]
    CommentAdded { comment: Comment },

    #[serde(rename = "comment_replied")]
    CommentReplied {
        comment_id: CommentId,
        reply: CommentReply,
    },

    #[serde(rename = "comment_resolved")]
    CommentResolved { comment: Comment },

    #[serde(rename = "approval_requested")]
    ApprovalRequested { approval: Approval },

    #[serde(rename = "approval_responded")]
    ApprovalResponded { approval: Approval },

    // Version history
    #[serde(rename = "version_created")]
    VersionCreated { version: VersionSummary },

    #[serde(rename = "document_restored")]
    DocumentRestored {
        version_id: VersionId,
        document: ReportDocument,
        field_versions: BTreeMap<FieldKey, FieldVersion>,
    },

    // Error handling
    #[serde(rename = "error")]
    Error { error: ErrorBody },

    // Heartbeat
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            CollaborationError::ValidationFailure(format!("malformed server message: {e}"))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(e: &CollaborationError) -> Self {
        Self::Error { error: e.into() }
    }

    /// Short name used in logs
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionJoined { .. } => "session_joined",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::SessionUpdated { .. } => "session_updated",
            Self::SessionEnded { .. } => "session_ended",
            Self::RealtimeEdit { .. } => "realtime_edit",
            Self::EditAck { .. } => "edit_ack",
            Self::EditRejected { .. } => "edit_rejected",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::ConflictResolved { .. } => "conflict_resolved",
            Self::SyncResponse { .. } => "sync_response",
            Self::CursorMoved { .. } => "cursor_moved",
            Self::CommentAdded { .. } => "comment_added",
            Self::CommentReplied { .. } => "comment_replied",
            Self::CommentResolved { .. } => "comment_resolved",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResponded { .. } => "approval_responded",
            Self::VersionCreated { .. } => "version_created",
            Self::DocumentRestored { .. } => "document_restored",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TextEdit;

    #[test]
    fn field_change_envelope() {
        let raw = format!(
            r#"{{
                "type": "field_change",
                "payload": {{
                    "operation": {{
                        "id": "{op}",
                        "session_id": "{session}",
                        "author": "{author}",
                        "timestamp": "2024-03-01T10:00:00Z",
                        "target": "findings.text",
                        "kind": "insert",
                        "position": 0,
                        "content": "normal",
                        "causal_token": 0
                    }}
                }}
            }}"#,
            op = uuid::Uuid::new_v4(),
            session = uuid::Uuid::new_v4(),
            author = uuid::Uuid::new_v4(),
        );

        match ClientMessage::from_json(&raw).unwrap() {
            ClientMessage::FieldChange { operation } => {
                assert_eq!(operation.target, FieldKey::new("findings", "text"));
                assert_eq!(
                    operation.edit,
                    TextEdit::Insert {
                        position: 0,
                        content: "normal".into()
                    }
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unit_messages_use_type_only() {
        assert_eq!(ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        let json = ServerMessage::Pong.to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn malformed_payload_is_validation_failure() {
        let err = ClientMessage::from_json(r#"{"type":"field_change","payload":{}}"#).unwrap_err();
        assert!(matches!(err, CollaborationError::ValidationFailure(_)));

        let err = ClientMessage::from_json(r#"{"type":"teleport"}"#).unwrap_err();
        assert_eq!(err.kind(), "validation_failure");
    }

    #[test]
    fn error_message_carries_kind() {
        let msg = ServerMessage::error(&CollaborationError::PermissionDenied("cannot edit".into()));
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["error"]["kind"], "permission_denied");
    }

    #[test]
    fn presence_messages_are_flagged() {
        let cursor = ClientMessage::CursorMove {
            position: CursorPosition::new(FieldKey::new("findings", "text"), 3),
            at: Utc::now(),
        };
        assert!(cursor.is_presence());
        assert!(!ClientMessage::LeaveSession.is_presence());
    }
}
