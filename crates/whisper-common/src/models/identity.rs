//! Identity lifecycle status.
//!
//! The identity row itself lives in the database crate; what the services
//! share is the status vocabulary. Public keys are immutable for the lifetime
//! of an identity — key rotation means a new identity.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Banned,
    Deleted,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Banned => "banned",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "banned" => Some(Self::Banned),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}
