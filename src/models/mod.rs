//! Data models for the ephemeral file store.
//!
//! Records map to the `files` table via `sqlx::FromRow` and serialize as
//! JSON via `serde`.

pub mod record;
