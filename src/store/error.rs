//! Error types for the download store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during download store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store was closed; every later call fails with this.
    #[error("{namespace} database is closed")]
    Closed { namespace: String },

    /// Failed to create the directory that holds the database file.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to prepare the schema (pragmas, fresh DDL, destructive reset).
    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A single version step failed and was rolled back.
    #[error("Migration from schema version {from} to {to} failed: {source}")]
    MigrationStep {
        from: i32,
        to: i32,
        source: rusqlite::Error,
    },

    /// No registered migration starts at this version.
    #[error("No migration registered from schema version {from}")]
    MissingMigration { from: i32 },

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}
