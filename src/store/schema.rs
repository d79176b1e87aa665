//! Database schema definitions and migrations.
//!
//! The schema version lives in `PRAGMA user_version`. Opening a database
//! older than [`SCHEMA_VERSION`] either walks the registered migrations one
//! version at a time, or, when the gap exceeds the policy's limit, drops
//! everything and recreates the current schema.

use rusqlite::Connection;

use super::error::StoreError;
use super::tags;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 3;

/// Default largest version gap bridged by sequential migration.
pub const DEFAULT_MAX_SEQUENTIAL_GAP: i32 = 2;

/// Full DDL for the current version.
const SCHEMA_CURRENT: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER NOT NULL PRIMARY KEY,
    namespace TEXT NOT NULL,
    url TEXT NOT NULL,
    file TEXT NOT NULL,
    group_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    headers TEXT NOT NULL,
    downloaded INTEGER NOT NULL,
    total INTEGER NOT NULL,
    status INTEGER NOT NULL,
    error TEXT NOT NULL,
    network_type INTEGER NOT NULL,
    created INTEGER NOT NULL,
    tag TEXT,
    enqueue_action INTEGER NOT NULL,
    identifier INTEGER NOT NULL,
    download_on_enqueue INTEGER NOT NULL,
    extras TEXT NOT NULL DEFAULT '{}',
    auto_retry_max_attempts INTEGER NOT NULL DEFAULT 0,
    auto_retry_attempts INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_file ON requests(file);
CREATE INDEX IF NOT EXISTS idx_requests_group_status ON requests(group_id, status);
CREATE INDEX IF NOT EXISTS idx_requests_identifier ON requests(identifier);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER NOT NULL PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tag_refs (
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    download_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
    PRIMARY KEY (tag_id, download_id)
);

CREATE INDEX IF NOT EXISTS idx_tag_refs_download ON tag_refs(download_id);
"#;

/// Version 1: requests only, no extras, no retry counters, no tag index.
#[cfg(test)]
pub(crate) const SCHEMA_V1: &str = r#"
CREATE TABLE requests (
    id INTEGER NOT NULL PRIMARY KEY,
    namespace TEXT NOT NULL,
    url TEXT NOT NULL,
    file TEXT NOT NULL,
    group_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    headers TEXT NOT NULL,
    downloaded INTEGER NOT NULL,
    total INTEGER NOT NULL,
    status INTEGER NOT NULL,
    error TEXT NOT NULL,
    network_type INTEGER NOT NULL,
    created INTEGER NOT NULL,
    tag TEXT,
    enqueue_action INTEGER NOT NULL,
    identifier INTEGER NOT NULL,
    download_on_enqueue INTEGER NOT NULL
);

CREATE UNIQUE INDEX idx_requests_file ON requests(file);
CREATE INDEX idx_requests_group_status ON requests(group_id, status);
"#;

const DROP_ALL: &str = r#"
DROP TABLE IF EXISTS tag_refs;
DROP TABLE IF EXISTS tags;
DROP TABLE IF EXISTS requests;
"#;

/// One version-to-version schema transformer.
///
/// `migrate` runs inside a transaction that also bumps `user_version`; any
/// error rolls the whole step back.
pub trait Migration: Send + Sync {
    fn start_version(&self) -> i32;
    fn end_version(&self) -> i32;
    fn migrate(&self, conn: &Connection) -> rusqlite::Result<()>;
}

/// When to give up on sequential migration and recreate the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPolicy {
    /// Largest `SCHEMA_VERSION - found` gap bridged step by step. `None`
    /// always migrates sequentially.
    pub max_sequential_gap: Option<i32>,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            max_sequential_gap: Some(DEFAULT_MAX_SEQUENTIAL_GAP),
        }
    }
}

impl MigrationPolicy {
    pub fn sequential_only() -> Self {
        Self {
            max_sequential_gap: None,
        }
    }

    fn requires_reset(&self, found: i32) -> bool {
        self.max_sequential_gap
            .is_some_and(|gap| SCHEMA_VERSION - found > gap)
    }
}

/// 1 -> 2: extras blob and auto-retry counters.
struct AddExtrasAndRetryColumns;

impl Migration for AddExtrasAndRetryColumns {
    fn start_version(&self) -> i32 {
        1
    }

    fn end_version(&self) -> i32 {
        2
    }

    fn migrate(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            ALTER TABLE requests ADD COLUMN extras TEXT NOT NULL DEFAULT '{}';
            ALTER TABLE requests ADD COLUMN auto_retry_max_attempts INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE requests ADD COLUMN auto_retry_attempts INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX IF NOT EXISTS idx_requests_identifier ON requests(identifier);
            "#,
        )
    }
}

/// 2 -> 3: tag index, seeded from the legacy single-tag column.
struct CreateTagIndex;

impl Migration for CreateTagIndex {
    fn start_version(&self) -> i32 {
        2
    }

    fn end_version(&self) -> i32 {
        3
    }

    fn migrate(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE tags (
                id INTEGER NOT NULL PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE tag_refs (
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                download_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                PRIMARY KEY (tag_id, download_id)
            );
            CREATE INDEX idx_tag_refs_download ON tag_refs(download_id);
            "#,
        )?;

        let legacy: Vec<(i32, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, tag FROM requests WHERE tag IS NOT NULL AND tag != ''",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (id, tag) in &legacy {
            tags::attach(conn, *id, [tag.as_str()])?;
        }
        if !legacy.is_empty() {
            tracing::debug!(count = legacy.len(), "Seeded tag index from legacy tags");
        }
        Ok(())
    }
}

/// The built-in migration chain, ordered by start version.
pub fn default_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(AddExtrasAndRetryColumns), Box::new(CreateTagIndex)]
}

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> rusqlite::Result<()> {
    conn.pragma_update(None, "user_version", version)
}

/// Initialize or migrate the database schema.
///
/// This function is idempotent and safe to call on both new and existing
/// databases. On error the database is left at the last version that
/// committed.
pub(crate) fn migrate(
    conn: &mut Connection,
    policy: &MigrationPolicy,
    migrations: &[Box<dyn Migration>],
) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        // Fresh database, apply full schema
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA_CURRENT)?;
        set_schema_version(&tx, SCHEMA_VERSION)?;
        tx.commit()?;
        tracing::debug!("Initialized database schema at version {}", SCHEMA_VERSION);
    } else if current_version < SCHEMA_VERSION {
        if policy.requires_reset(current_version) {
            reset(conn, current_version)?;
        } else {
            let mut version = current_version;
            while version < SCHEMA_VERSION {
                let step = migrations
                    .iter()
                    .find(|m| {
                        m.start_version() == version
                            && m.end_version() > version
                            && m.end_version() <= SCHEMA_VERSION
                    })
                    .ok_or(StoreError::MissingMigration { from: version })?;
                run_step(conn, step.as_ref())?;
                version = step.end_version();
            }
        }
    }

    Ok(())
}

/// Apply one migration atomically.
fn run_step(conn: &mut Connection, migration: &dyn Migration) -> Result<(), StoreError> {
    let from = migration.start_version();
    let to = migration.end_version();
    let step_error = |source| StoreError::MigrationStep { from, to, source };

    let tx = conn.transaction().map_err(step_error)?;
    migration.migrate(&tx).map_err(step_error)?;
    set_schema_version(&tx, to).map_err(step_error)?;
    tx.commit().map_err(step_error)?;

    tracing::info!("Migrated database from schema version {} to {}", from, to);
    Ok(())
}

/// Drop every table and recreate the current schema. No data survives.
fn reset(conn: &mut Connection, found: i32) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(DROP_ALL)?;
    tx.execute_batch(SCHEMA_CURRENT)?;
    set_schema_version(&tx, SCHEMA_VERSION)?;
    tx.commit()?;
    tracing::warn!(
        "Schema version {} too old to migrate, recreated database at version {}",
        found,
        SCHEMA_VERSION
    );
    Ok(())
}
