//! Core data models for the resumable transfer engine.
//!
//! These types are plain serializable records: everything a later process
//! invocation needs to resume a transfer round-trips through them.

pub mod backup;
pub mod cursor;
pub mod entry;
pub mod job;
pub mod multipart;
