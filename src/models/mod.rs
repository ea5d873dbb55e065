//! Core data models for the blob collection service.
//!
//! Collections and items map to database tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod collection;
pub mod content_address;
pub mod usage;
