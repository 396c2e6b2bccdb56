use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

mod document;
pub use document::*;
mod edit;
pub use edit::*;
mod diff;
pub use diff::*;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
    #[error("position {position} out of bounds for field {key} (length {len})")]
    OutOfBounds {
        key: FieldKey,
        position: usize,
        len: usize,
    },
    #[error("section not found: {0}")]
    SectionNotFound(SectionId),
    #[error("field not found: {0}")]
    FieldNotFound(FieldKey),
    #[error("malformed field key: {0}")]
    MalformedKey(String),
}

pub type Result<T> = std::result::Result<T, ReportError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ReportId(pub Uuid);

impl ReportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Report section name, e.g. `findings` or `impression`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SectionId(pub String);

impl SectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FieldId(pub String);

impl FieldId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Independently versioned editable unit: `(section, field)`
///
/// Serialized in its dotted form `section.field`, so section ids must not contain `.`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey {
    pub section: SectionId,
    pub field: FieldId,
}

impl FieldKey {
    pub fn new(section: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            section: SectionId::new(section),
            field: FieldId::new(field),
        }
    }

    /// Parse the dotted form `section.field`
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((section, field)) if !section.is_empty() && !field.is_empty() => {
                Ok(Self::new(section, field))
            }
            _ => Err(ReportError::MalformedKey(s.to_string())),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.field)
    }
}

impl Serialize for FieldKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        FieldKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for FieldKey {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
