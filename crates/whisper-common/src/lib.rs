//! # whisper-common
//!
//! Shared foundation for all Whisper server crates:
//! - Application configuration
//! - The `WhisperError` type and stable wire error codes
//! - WhisperID parsing and derivation
//! - Canonical-form construction and Ed25519 signature verification
//! - The typed frame catalog (the only place client JSON is parsed)

pub mod canonical;
pub mod config;
pub mod error;
pub mod frames;
pub mod models;
pub mod validation;
pub mod whisper_id;

pub use error::{WhisperError, WhisperResult};
pub use whisper_id::WhisperId;
