//! Persistent download store.
//!
//! This module provides SQLite-based persistence for a download manager's
//! queue. It tracks every download request with its progress and status,
//! enabling:
//! - Resuming the queue after a restart
//! - Reconciling records left stale by a crash or a deleted file
//! - Tag, group and status queries for the scheduler
//! - Versioned schema migrations

pub mod db;
pub mod error;
pub mod sanitize;
pub mod schema;
pub mod tags;
pub mod types;

pub use db::DownloadStore;
pub use error::StoreError;
pub use sanitize::{FileProbe, LocalFileProbe, StoreDelegate};
pub use schema::{Migration, MigrationPolicy, SCHEMA_VERSION};
pub use tags::tag_id;
pub use types::{
    ColdStart, DownloadRecord, EnqueueAction, ErrorPayload, Extras, NetworkType, Outcome,
    Priority, PrioritySort, Status,
};
