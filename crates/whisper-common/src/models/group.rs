//! Group roles.
//!
//! Group and membership rows live in the database crate; the shared piece is
//! the role vocabulary and its permission split. Exactly one owner per group.

use serde::{Deserialize, Serialize};

/// Role of a member within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    Member,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    /// Owners and admins may mutate membership.
    pub fn may_manage_members(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}
