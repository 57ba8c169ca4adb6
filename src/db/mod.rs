//! SQL store for jobs, per-note sync state, credentials, and job logs.
//!
//! Repository functions map rows into the domain entities from
//! `crate::model`. The repository API is re-exported here, so callers
//! import from `keep_sync::db` directly.

pub mod repo;

pub use repo::*;
