//! Repository modules — one per table family, free functions over `PgPool`.

pub mod attachments;
pub mod backups;
pub mod contact_hints;
pub mod envelopes;
pub mod groups;
pub mod identities;
pub mod pending;
pub mod sessions;
