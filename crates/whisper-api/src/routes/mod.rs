//! API route modules.

pub mod attachments;
pub mod backup;
pub mod health;
pub mod users;
