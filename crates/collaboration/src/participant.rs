/// Participants, roles and permission grants
use serde::{Deserialize, Serialize};

use crate::{CursorPosition, ParticipantId};

/// Clinical or deployment role of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Attending,
    Resident,
    Fellow,
    Student,
    Radiologist,
    Technologist,
    Admin,
    Viewer,
}

impl Role {
    /// Grants a participant receives on join when none were configured
    pub fn default_permissions(self) -> Permissions {
        match self {
            Role::Attending | Role::Radiologist => Permissions::all(),
            Role::Fellow => Permissions {
                can_edit: true,
                can_comment: true,
                can_approve: true,
                can_sign: false,
            },
            Role::Resident => Permissions {
                can_edit: true,
                can_comment: true,
                can_approve: false,
                can_sign: false,
            },
            Role::Admin => Permissions {
                can_edit: true,
                can_comment: true,
                can_approve: true,
                can_sign: false,
            },
            Role::Student | Role::Technologist => Permissions {
                can_comment: true,
                ..Permissions::none()
            },
            Role::Viewer => Permissions::none(),
        }
    }

    /// Roles allowed to change session permissions and settings
    pub fn can_administer(self) -> bool {
        matches!(self, Role::Admin | Role::Attending)
    }
}

/// Permission grants for one participant in one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_edit: bool,
    pub can_comment: bool,
    pub can_approve: bool,
    pub can_sign: bool,
}

impl Permissions {
    pub const fn none() -> Self {
        Self {
            can_edit: false,
            can_comment: false,
            can_approve: false,
            can_sign: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            can_edit: true,
            can_comment: true,
            can_approve: true,
            can_sign: true,
        }
    }

    pub fn apply(&mut self, patch: &PermissionPatch) {
        if let Some(v) = patch.can_edit {
            self.can_edit = v;
        }
        if let Some(v) = patch.can_comment {
            self.can_comment = v;
        }
        if let Some(v) = patch.can_approve {
            self.can_approve = v;
        }
        if let Some(v) = patch.can_sign {
            self.can_sign = v;
        }
    }
}

/// Partial permission update; `None` leaves a grant unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_edit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_comment: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_approve: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_sign: Option<bool>,
}

impl From<Permissions> for PermissionPatch {
    fn from(p: Permissions) -> Self {
        Self {
            can_edit: Some(p.can_edit),
            can_comment: Some(p.can_comment),
            can_approve: Some(p.can_approve),
            can_sign: Some(p.can_sign),
        }
    }
}

/// A user attached to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub color: UserColor,
    #[serde(default)]
    pub online: bool,
    #[serde(default = "chrono::Utc::now")]
    pub last_seen: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub focus: Option<CursorPosition>,
}

impl Participant {
    pub fn new(id: ParticipantId, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            color: UserColor::from_participant_id(id),
            online: false,
            last_seen: chrono::Utc::now(),
            focus: None,
        }
    }
}

/// Color assigned to a participant for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Deterministic color derived from the participant id
    pub fn from_participant_id(id: ParticipantId) -> Self {
        let bytes = id.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_color_is_stable_per_participant() {
        let id = ParticipantId::new();
        let color = UserColor::from_participant_id(id);
        assert_eq!(color, UserColor::from_participant_id(id));

        let hex = color.to_hex();
        assert!(hex.starts_with('#'));
        assert_eq!(hex.len(), 7);
    }

    #[test]
    fn role_defaults() {
        assert_eq!(Role::Attending.default_permissions(), Permissions::all());
        assert_eq!(Role::Viewer.default_permissions(), Permissions::none());

        let student = Role::Student.default_permissions();
        assert!(student.can_comment);
        assert!(!student.can_edit);

        let resident = Role::Resident.default_permissions();
        assert!(resident.can_edit);
        assert!(!resident.can_sign);
    }

    #[test]
    fn patch_only_touches_given_grants() {
        let mut perms = Role::Resident.default_permissions();
        perms.apply(&PermissionPatch {
            can_edit: Some(false),
            ..Default::default()
        });
        assert!(!perms.can_edit);
        assert!(perms.can_comment);
    }
}
