/// Real-time collaborative editing of structured reports
/// Sessions, presence, field-level edit propagation, conflict resolution,
/// comments and version history
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod config;
pub use config::*;

mod participant;
pub use participant::*;

mod presence;
pub use presence::*;

mod operations;
pub use operations::*;

mod conflict;
pub use conflict::*;

mod pipeline;
pub use pipeline::*;

mod comments;
pub use comments::*;

mod versions;
pub use versions::*;

mod audit;
pub use audit::*;

mod sync;
pub use sync::*;

mod broadcast;
pub use broadcast::*;

mod session;
pub use session::*;

mod registry;
pub use registry::*;

mod timer;
pub use timer::*;

mod supervisor;
pub use supervisor::*;

mod ws;
pub use ws::*;

mod service;
pub use service::*;

pub use report::{
    Change, Field, FieldId, FieldKey, FormatMark, ReportDocument, ReportError, ReportId,
    SectionId, TextEdit,
};

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("a session is already active for report {0}")]
    AlreadyActive(ReportId),

    #[error("already resolved: {0}")]
    AlreadyResolved(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection failed after {attempts} reconnect attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl CollaborationError {
    /// Stable snake_case name sent to clients in `error` messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::AlreadyActive(_) => "already_active",
            Self::AlreadyResolved(_) => "already_resolved",
            Self::ConnectionLost(_) => "connection_lost",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::ValidationFailure(_) | Self::Report(_) => "validation_failure",
            Self::SerializationError(_) => "serialization_error",
            Self::NetworkError(_) => "network_error",
            Self::StorageError(_) => "storage_error",
        }
    }

    /// Transient errors the connection supervisor retries on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::NetworkError(_))
    }
}

impl From<serde_json::Error> for CollaborationError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Per-field monotonically increasing version, starting at 0
pub type FieldVersion = u64;

/// Participant identifier (identity is resolved upstream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub uuid::Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier for a collaborative editing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
