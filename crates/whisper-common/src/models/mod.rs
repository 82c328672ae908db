//! Domain models shared between the gateway, API, and database crates.
//!
//! These are the wire/domain shapes. The database crate keeps its own flat
//! row structs for the persisted forms.

pub mod call;
pub mod envelope;
pub mod group;
pub mod identity;

pub use call::{Call, CallEndReason, CallState};
pub use envelope::{AttachmentRef, Envelope};
pub use group::GroupRole;
pub use identity::IdentityStatus;
