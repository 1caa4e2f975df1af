//! Core data models for the temporary file-sharing service.
//!
//! Records map to the `images` and `short_links` tables via `sqlx::FromRow`
//! and serialize as JSON via `serde`. Rows are never mutated after insert;
//! deletion is the only update.

pub mod image;
pub mod short_link;
pub mod upload;
