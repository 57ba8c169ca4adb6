//! Sync service bridging Google Keep and Notion.
//!
//! Notes are pulled from the Keep extractor service, mirrored into Notion
//! through the writer service, and tracked per user in a local SQLite store
//! so later runs only touch what changed.

pub mod config;
pub mod db;
pub mod http;
pub mod jobs;
pub mod keep;
pub mod model;
pub mod notify;
pub mod notion;
pub mod orchestrator;
pub mod runner;
pub mod vault;
