//! SQLite-backed download store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use super::error::StoreError;
use super::sanitize::{self, FileProbe, LocalFileProbe, SanitizePass, StoreDelegate};
use super::schema::{self, Migration, MigrationPolicy};
use super::tags;
use super::types::{
    ColdStart, DownloadRecord, EnqueueAction, ErrorPayload, Extras, NetworkType, Outcome,
    Priority, PrioritySort, Status,
};
use crate::codec;
use crate::config::StoreConfig;

/// Column list shared by every record query; order matches [`record_to_row`].
const COLUMNS: &str = "id, namespace, url, file, group_id, priority, headers, downloaded, \
    total, status, error, network_type, created, tag, enqueue_action, identifier, \
    download_on_enqueue, extras, auto_retry_max_attempts, auto_retry_attempts";

const INSERT_SQL: &str = "INSERT OR IGNORE INTO requests (id, namespace, url, file, group_id, \
    priority, headers, downloaded, total, status, error, network_type, created, tag, \
    enqueue_action, identifier, download_on_enqueue, extras, auto_retry_max_attempts, \
    auto_retry_attempts) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)";

const UPDATE_SQL: &str = "UPDATE requests SET namespace = ?2, url = ?3, file = ?4, \
    group_id = ?5, priority = ?6, headers = ?7, downloaded = ?8, total = ?9, status = ?10, \
    error = ?11, network_type = ?12, created = ?13, tag = ?14, enqueue_action = ?15, \
    identifier = ?16, download_on_enqueue = ?17, extras = ?18, \
    auto_retry_max_attempts = ?19, auto_retry_attempts = ?20 \
    WHERE id = ?1";

/// Output of one sanitize-and-write-back pass.
struct Reconciled {
    records: Vec<DownloadRecord>,
    repaired: usize,
    outcome: Outcome,
    /// Records whose progress was discarded; the delegate is told about
    /// these after the connection lock is released.
    stale: Vec<DownloadRecord>,
}

/// Process-wide settings the store consults.
#[derive(Debug, Default)]
struct StoreSettings {
    did_sanitize_on_first_entry: bool,
}

/// Persistent store of download records.
///
/// Every call is synchronous and may block on SQLite I/O; async callers
/// should go through `spawn_blocking`. The store is `Send + Sync` and meant
/// to be shared behind an `Arc`. Once [`close`](Self::close) runs, every
/// operation fails with [`StoreError::Closed`].
pub struct DownloadStore {
    /// `None` after close. rusqlite::Connection is not Sync.
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    settings: Mutex<StoreSettings>,
    namespace: String,
    /// Path to the database file (for error messages).
    path: PathBuf,
    file_exist_checks_enabled: bool,
    file_probe: Arc<dyn FileProbe>,
    delegate: Option<Arc<dyn StoreDelegate>>,
}

impl std::fmt::Debug for DownloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStore")
            .field("namespace", &self.namespace)
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DownloadStore {
    /// Open or create the database described by `config`, migrating it to
    /// the current schema.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_migrations(config, &schema::default_migrations())
    }

    /// [`open`](Self::open) with a caller-supplied migration chain.
    pub fn open_with_migrations(
        config: &StoreConfig,
        migrations: &[Box<dyn Migration>],
    ) -> Result<Self, StoreError> {
        let path = config.database_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut conn = Connection::open(&path).map_err(|e| StoreError::Open {
            path: path.clone(),
            source: e,
        })?;

        // WAL lets readers proceed while a progress update commits
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::Migration)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StoreError::Migration)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::Migration)?;

        schema::migrate(&mut conn, &config.migration_policy, migrations)?;
        tracing::debug!(namespace = %config.namespace, path = %path.display(), "Opened download store");

        Ok(Self::from_connection(
            conn,
            config.namespace.clone(),
            path,
            config.file_exist_checks_enabled,
        ))
    }

    /// Open an in-memory database (for testing and throwaway queues).
    pub fn open_in_memory(namespace: &str) -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::Migration)?;
        schema::migrate(
            &mut conn,
            &MigrationPolicy::default(),
            &schema::default_migrations(),
        )?;
        Ok(Self::from_connection(
            conn,
            namespace.to_string(),
            PathBuf::from(":memory:"),
            true,
        ))
    }

    fn from_connection(
        conn: Connection,
        namespace: String,
        path: PathBuf,
        file_exist_checks_enabled: bool,
    ) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
            settings: Mutex::new(StoreSettings::default()),
            namespace,
            path,
            file_exist_checks_enabled,
            file_probe: Arc::new(LocalFileProbe),
            delegate: None,
        }
    }

    /// Receive temp-file cleanup requests from sanitization.
    pub fn with_delegate(mut self, delegate: Arc<dyn StoreDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Replace the filesystem probe used for file-existence checks.
    pub fn with_file_probe(mut self, probe: Arc<dyn FileProbe>) -> Self {
        self.file_probe = probe;
        self
    }

    pub fn with_file_exist_checks(mut self, enabled: bool) -> Self {
        self.file_exist_checks_enabled = enabled;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A record with storage defaults, stamped with this store's namespace.
    pub fn new_record(&self, id: i32, url: &str, file: &str) -> DownloadRecord {
        let mut record = DownloadRecord::new(id, url, file);
        record.namespace = self.namespace.clone();
        record
    }

    fn closed_error(&self) -> StoreError {
        StoreError::Closed {
            namespace: self.namespace.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    /// Run `f` against the live connection.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_open()?;
        let guard = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        // close() may have won the race between the flag check and the lock
        let conn = guard.as_ref().ok_or_else(|| self.closed_error())?;
        f(conn)
    }

    // ── Writes ──

    /// Insert `record`. The flag is false when the row was rejected, e.g. its
    /// id or destination file is already taken.
    pub fn insert(&self, record: DownloadRecord) -> Result<(DownloadRecord, bool), StoreError> {
        self.with_conn(|conn| {
            let inserted = in_transaction(conn, |conn| {
                let inserted = insert_row(conn, &record)?;
                if inserted {
                    tags::sync_record(conn, &record).map_err(StoreError::query)?;
                }
                Ok(inserted)
            })?;
            if !inserted {
                tracing::error!(id = record.id, file = %record.file, "Insert rejected");
            }
            Ok((record, inserted))
        })
    }

    /// Insert many records; a rejected or failing row does not stop the rest.
    pub fn insert_batch(
        &self,
        records: Vec<DownloadRecord>,
    ) -> Result<Vec<(DownloadRecord, bool)>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            in_transaction(conn, |conn| {
                let results: Vec<(DownloadRecord, bool)> = records
                    .into_iter()
                    .map(|record| {
                        let inserted = match insert_row(conn, &record) {
                            Ok(true) => {
                                if let Err(e) = tags::sync_record(conn, &record) {
                                    tracing::warn!(id = record.id, error = %e, "Tag sync failed after insert");
                                }
                                true
                            }
                            Ok(false) => {
                                tracing::error!(id = record.id, file = %record.file, "Insert rejected");
                                false
                            }
                            Err(e) => {
                                tracing::error!(id = record.id, error = %e, "Insert failed");
                                false
                            }
                        };
                        (record, inserted)
                    })
                    .collect();
                Ok(results)
            })
        })
    }

    /// Persist every mutable field of `record` and re-sync its tags.
    ///
    /// Returns false, without error, when no row has this id.
    pub fn update(&self, record: &DownloadRecord) -> Result<bool, StoreError> {
        self.with_conn(|conn| in_transaction(conn, |conn| update_row(conn, record)))
    }

    /// [`update`](Self::update) for many records in one transaction. Ids
    /// with no row are skipped and logged. Returns how many rows changed.
    pub fn update_batch(&self, records: &[DownloadRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| in_transaction(conn, |conn| update_rows(conn, records)))
    }

    /// Write only progress and status for `record.id`.
    ///
    /// Runs on the hot path of an active transfer. Storage failures are
    /// logged and reported as [`Outcome::Degraded`]; the only error is
    /// [`StoreError::Closed`].
    pub fn update_progress_and_status(
        &self,
        record: &DownloadRecord,
    ) -> Result<Outcome, StoreError> {
        self.ensure_open()?;
        let guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(e) => return Ok(Outcome::from_warnings(vec![e.to_string()])),
        };
        let conn = guard.as_ref().ok_or_else(|| self.closed_error())?;

        let result = in_transaction(conn, |conn| {
            conn.prepare_cached(
                "UPDATE requests SET downloaded = ?1, total = ?2, status = ?3 WHERE id = ?4",
            )
            .and_then(|mut stmt| {
                stmt.execute(rusqlite::params![
                    record.downloaded,
                    record.total,
                    record.status.as_i32(),
                    record.id,
                ])
            })
            .map_err(StoreError::query)
        });

        match result {
            Ok(_) => Ok(Outcome::Applied),
            Err(e) => {
                tracing::warn!(id = record.id, error = %e, "Progress update failed");
                Ok(Outcome::from_warnings(vec![e.to_string()]))
            }
        }
    }

    /// Soft delete marks the record deleted and keeps the row; hard delete
    /// removes it along with its tag refs. Returns whether a row was touched.
    pub fn delete(&self, record: &DownloadRecord, soft: bool) -> Result<bool, StoreError> {
        self.delete_batch(std::slice::from_ref(record), soft)
            .map(|count| count > 0)
    }

    pub fn delete_batch(&self, records: &[DownloadRecord], soft: bool) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            in_transaction(conn, |conn| {
                if soft {
                    let deleted: Vec<DownloadRecord> = records
                        .iter()
                        .map(|r| DownloadRecord {
                            status: Status::Deleted,
                            ..r.clone()
                        })
                        .collect();
                    update_rows(conn, &deleted)
                } else {
                    let mut stmt = conn
                        .prepare_cached("DELETE FROM requests WHERE id = ?1")
                        .map_err(StoreError::query)?;
                    let mut removed = 0;
                    for record in records {
                        removed += stmt.execute([record.id]).map_err(StoreError::query)?;
                    }
                    Ok(removed)
                }
            })
        })
    }

    /// Remove every record.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let removed = conn
                .execute("DELETE FROM requests", [])
                .map_err(StoreError::query)?;
            tracing::debug!(namespace = %self.namespace, removed, "Cleared database");
            Ok(removed)
        })
    }

    /// Replace the extras of `id`; returns the refreshed, sanitized record,
    /// or `None` when the id does not exist.
    pub fn update_extras(
        &self,
        id: i32,
        extras: &Extras,
    ) -> Result<Option<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| self.write_extras(conn, id, extras, stale))
    }

    /// Remove `key` from the extras of `id`.
    pub fn delete_extra_by_key(
        &self,
        id: i32,
        key: &str,
    ) -> Result<Option<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| self.remove_extra(conn, id, key, stale))
    }

    /// Remove `key` from the extras of every existing id.
    pub fn delete_extras_by_key(
        &self,
        ids: &[i32],
        key: &str,
    ) -> Result<Vec<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| {
            let mut updated = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = self.remove_extra(conn, *id, key, stale)? {
                    updated.push(record);
                }
            }
            Ok(updated)
        })
    }

    /// Set `priority` on every existing id; returns the updated records.
    pub fn update_priority(
        &self,
        ids: &[i32],
        priority: Priority,
    ) -> Result<Vec<DownloadRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut records = select_by_ids(conn, ids)?;
            tags::enrich(conn, &mut records).map_err(StoreError::query)?;
            for record in &mut records {
                record.priority = priority;
            }
            in_transaction(conn, |conn| update_rows(conn, &records))?;
            Ok(records)
        })
    }

    fn write_extras(
        &self,
        conn: &Connection,
        id: i32,
        extras: &Extras,
        stale: &mut Vec<DownloadRecord>,
    ) -> Result<Option<DownloadRecord>, StoreError> {
        let changed = conn
            .prepare_cached("UPDATE requests SET extras = ?1 WHERE id = ?2")
            .and_then(|mut stmt| stmt.execute(rusqlite::params![codec::encode(extras), id]))
            .map_err(StoreError::query)?;
        if changed == 0 {
            tracing::debug!(id, "Extras update skipped, no such download");
            return Ok(None);
        }
        self.read_one(conn, id, stale)
    }

    fn remove_extra(
        &self,
        conn: &Connection,
        id: i32,
        key: &str,
        stale: &mut Vec<DownloadRecord>,
    ) -> Result<Option<DownloadRecord>, StoreError> {
        let Some(mut record) = select_one(conn, "id = ?1", [id])? else {
            return Ok(None);
        };
        record.extras.remove_by_key(key);
        self.write_extras(conn, id, &record.extras, stale)
    }

    // ── Reads ──
    //
    // Every getter below sanitizes what it read and writes repairs back.
    // A failed write-back is logged and the repaired records are still
    // returned; only `sanitize_on_first_entry` reports it as an `Outcome`.

    /// All records.
    pub fn get_all(&self) -> Result<Vec<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| {
            let records = select_where(conn, "1 = 1 ORDER BY id", [])?;
            self.finish_read(conn, records, stale)
        })
    }

    pub fn get(&self, id: i32) -> Result<Option<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| self.read_one(conn, id, stale))
    }

    /// Existing records among `ids`, in the order requested.
    pub fn get_many(&self, ids: &[i32]) -> Result<Vec<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| {
            let records = select_by_ids(conn, ids)?;
            self.finish_read(conn, records, stale)
        })
    }

    /// The record downloading to `file`.
    pub fn get_by_file(&self, file: &str) -> Result<Option<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| {
            let record = select_one(conn, "file = ?1", [file])?;
            let records = self.finish_read(conn, record.into_iter().collect(), stale)?;
            Ok(records.into_iter().next())
        })
    }

    pub fn get_by_status(&self, status: Status) -> Result<Vec<DownloadRecord>, StoreError> {
        self.get_by_statuses(&[status])
    }

    /// Records in any of `statuses`. Records the sanitizer moves out of the
    /// set are dropped from the result.
    pub fn get_by_statuses(&self, statuses: &[Status]) -> Result<Vec<DownloadRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        self.read_with(|conn, stale| {
            let clause = format!("status IN ({}) ORDER BY id", placeholders(statuses.len()));
            let records = select_where(conn, &clause, params_from_iter(status_codes(statuses)))?;
            let records = self.finish_read(conn, records, stale)?;
            Ok(retain_statuses(records, statuses))
        })
    }

    pub fn get_by_group(&self, group: i32) -> Result<Vec<DownloadRecord>, StoreError> {
        self.get_by_groups(&[group])
    }

    pub fn get_by_groups(&self, groups: &[i32]) -> Result<Vec<DownloadRecord>, StoreError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        self.read_with(|conn, stale| {
            let clause = format!("group_id IN ({}) ORDER BY id", placeholders(groups.len()));
            let records = select_where(conn, &clause, params_from_iter(groups))?;
            self.finish_read(conn, records, stale)
        })
    }

    /// Records of `group` in any of `statuses`.
    pub fn get_by_group_with_statuses(
        &self,
        group: i32,
        statuses: &[Status],
    ) -> Result<Vec<DownloadRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        self.read_with(|conn, stale| {
            let clause = format!(
                "group_id = ? AND status IN ({}) ORDER BY id",
                placeholders(statuses.len())
            );
            let params = std::iter::once(group).chain(status_codes(statuses));
            let records = select_where(conn, &clause, params_from_iter(params))?;
            let records = self.finish_read(conn, records, stale)?;
            Ok(retain_statuses(records, statuses))
        })
    }

    /// Every record created from the request `identifier`.
    pub fn get_by_identifier(&self, identifier: i64) -> Result<Vec<DownloadRecord>, StoreError> {
        self.get_by_identifiers(&[identifier])
    }

    pub fn get_by_identifiers(
        &self,
        identifiers: &[i64],
    ) -> Result<Vec<DownloadRecord>, StoreError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        self.read_with(|conn, stale| {
            let clause = format!(
                "identifier IN ({}) ORDER BY id",
                placeholders(identifiers.len())
            );
            let records = select_where(conn, &clause, params_from_iter(identifiers))?;
            self.finish_read(conn, records, stale)
        })
    }

    /// Queued records, highest priority first, then by creation time in the
    /// requested direction.
    pub fn get_pending_sorted(&self, sort: PrioritySort) -> Result<Vec<DownloadRecord>, StoreError> {
        self.read_with(|conn, stale| {
            let clause = match sort {
                PrioritySort::Asc => "status = ?1 ORDER BY priority DESC, created ASC, id ASC",
                PrioritySort::Desc => "status = ?1 ORDER BY priority DESC, created DESC, id DESC",
            };
            let records = select_where(conn, clause, [Status::Queued.as_i32()])?;
            let records = self.finish_read(conn, records, stale)?;
            Ok(retain_statuses(records, &[Status::Queued]))
        })
    }

    /// Distinct group ids, ascending.
    pub fn get_all_group_ids(&self) -> Result<Vec<i32>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT DISTINCT group_id FROM requests ORDER BY group_id")
                .map_err(StoreError::query)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i32>(0))
                .map_err(StoreError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::query)?;
            Ok(ids)
        })
    }

    /// Number of queued or downloading records, plus added ones when
    /// `include_added` is set.
    pub fn get_pending_count(&self, include_added: bool) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let added = if include_added {
                Status::Added.as_i32()
            } else {
                Status::Queued.as_i32()
            };
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM requests WHERE status IN (?1, ?2, ?3)",
                    rusqlite::params![Status::Queued.as_i32(), Status::Downloading.as_i32(), added],
                    |row| row.get(0),
                )
                .map_err(StoreError::query)?;
            Ok(count as u64)
        })
    }

    /// Records carrying `label`.
    pub fn get_by_tag(&self, label: &str) -> Result<Vec<DownloadRecord>, StoreError> {
        self.get_by_tags(&[label])
    }

    /// Records carrying any of `labels`, each listed once, in label order.
    pub fn get_by_tags(&self, labels: &[&str]) -> Result<Vec<DownloadRecord>, StoreError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        self.read_with(|conn, stale| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {} FROM requests r JOIN tag_refs t ON t.download_id = r.id \
                     WHERE t.tag_id = ?1 ORDER BY r.id",
                    prefixed_columns("r")
                ))
                .map_err(StoreError::query)?;

            let mut records: Vec<DownloadRecord> = Vec::new();
            for label in labels {
                let found = stmt
                    .query_map([tags::tag_id(label)], row_to_record)
                    .map_err(StoreError::query)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::query)?;
                for record in found {
                    if !records.iter().any(|r| r.id == record.id) {
                        records.push(record);
                    }
                }
            }
            drop(stmt);
            self.finish_read(conn, records, stale)
        })
    }

    /// Run the cold-start reconciliation once per store lifetime.
    ///
    /// Downloads left marked downloading by a previous process are settled
    /// as completed or re-queued. Later calls return
    /// [`ColdStart::AlreadyDone`]. A failed write-back of the repairs comes
    /// back as [`Outcome::Degraded`].
    pub fn sanitize_on_first_entry(&self) -> Result<ColdStart, StoreError> {
        self.ensure_open()?;
        let mut stale = Vec::new();
        let result = {
            let mut settings = self
                .settings
                .lock()
                .map_err(|e| StoreError::Query(e.to_string()))?;
            if settings.did_sanitize_on_first_entry {
                return Ok(ColdStart::AlreadyDone);
            }

            let (repaired, outcome) = self.with_conn(|conn| {
                let mut records = select_where(conn, "1 = 1 ORDER BY id", [])?;
                tags::enrich(conn, &mut records).map_err(StoreError::query)?;
                let reconciled = self.reconcile(conn, records, true);
                stale = reconciled.stale;
                Ok((reconciled.repaired, reconciled.outcome))
            })?;

            settings.did_sanitize_on_first_entry = true;
            tracing::debug!(namespace = %self.namespace, repaired, "Cold-start sanitization finished");
            ColdStart::Completed { repaired, outcome }
        };

        self.notify_stale(&stale);
        Ok(result)
    }

    /// Run `f` under the connection lock, collecting records whose progress
    /// was discarded, and hand those to the delegate once the lock is
    /// released. The delegate may call back into the store.
    fn read_with<T>(
        &self,
        f: impl FnOnce(&Connection, &mut Vec<DownloadRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut stale = Vec::new();
        let result = self.with_conn(|conn| f(conn, &mut stale));
        self.notify_stale(&stale);
        result
    }

    fn notify_stale(&self, stale: &[DownloadRecord]) {
        let Some(delegate) = &self.delegate else {
            return;
        };
        for record in stale {
            delegate.delete_temp_files_for_download(record);
        }
    }

    fn read_one(
        &self,
        conn: &Connection,
        id: i32,
        stale: &mut Vec<DownloadRecord>,
    ) -> Result<Option<DownloadRecord>, StoreError> {
        let record = select_one(conn, "id = ?1", [id])?;
        let records = self.finish_read(conn, record.into_iter().collect(), stale)?;
        Ok(records.into_iter().next())
    }

    /// Attach tags, then sanitize and write back whatever changed. Stale
    /// records are appended to `stale`; write-back warnings are only logged.
    fn finish_read(
        &self,
        conn: &Connection,
        mut records: Vec<DownloadRecord>,
        stale: &mut Vec<DownloadRecord>,
    ) -> Result<Vec<DownloadRecord>, StoreError> {
        if records.is_empty() {
            return Ok(records);
        }
        tags::enrich(conn, &mut records).map_err(StoreError::query)?;
        let reconciled = self.reconcile(conn, records, false);
        stale.extend(reconciled.stale);
        Ok(reconciled.records)
    }

    /// Sanitize `records` and persist the repaired subset in one
    /// transaction. Write-back failures are logged, not returned.
    fn reconcile(
        &self,
        conn: &Connection,
        records: Vec<DownloadRecord>,
        first_entry: bool,
    ) -> Reconciled {
        let probe = self
            .file_exist_checks_enabled
            .then_some(self.file_probe.as_ref());
        let pass = if first_entry {
            SanitizePass::first_entry(probe)
        } else {
            SanitizePass::routine(probe)
        };
        let result = sanitize::sanitize(records, &pass);
        if !result.is_changed() {
            return Reconciled {
                records: result.records,
                repaired: 0,
                outcome: Outcome::Applied,
                stale: Vec::new(),
            };
        }

        let repaired = result.changed_count();
        let changed: Vec<DownloadRecord> = result.changed().cloned().collect();
        let outcome = match in_transaction(conn, |conn| update_rows(conn, &changed)) {
            Ok(_) => Outcome::Applied,
            Err(e) => {
                tracing::warn!(error = %e, repaired, "Failed to persist sanitized downloads");
                Outcome::from_warnings(vec![e.to_string()])
            }
        };
        let stale = result.stale().cloned().collect();

        Reconciled {
            records: result.records,
            repaired,
            outcome,
            stale,
        }
    }

    /// Close the store. Later calls fail with [`StoreError::Closed`]; closing
    /// twice is a no-op.
    ///
    /// The WAL checkpoint and the connection close are attempted
    /// independently; failures are logged and returned as warnings.
    pub fn close(&self) -> Outcome {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Outcome::Applied;
        }

        let conn = match self.conn.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(conn) = conn else {
            return Outcome::Applied;
        };

        let mut warnings = Vec::new();
        conn.flush_prepared_statement_cache();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)") {
            tracing::warn!(error = %e, "WAL checkpoint failed during close");
            warnings.push(e.to_string());
        }
        if let Err((_, e)) = conn.close() {
            tracing::warn!(error = %e, "Connection close failed");
            warnings.push(e.to_string());
        }

        tracing::debug!(namespace = %self.namespace, "Database closed");
        Outcome::from_warnings(warnings)
    }
}

/// Run `f` inside BEGIN/COMMIT, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(StoreError::query)?;

    let result = f(conn).and_then(|value| {
        conn.execute_batch("COMMIT")
            .map_err(StoreError::query)?;
        Ok(value)
    });

    if result.is_err() {
        let _ = conn.execute_batch("ROLLBACK");
    }
    result
}

fn insert_row(conn: &Connection, record: &DownloadRecord) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare_cached(INSERT_SQL).map_err(StoreError::query)?;
    let changes = stmt
        .execute(params_from_iter(record_to_row(record)))
        .map_err(StoreError::query)?;
    Ok(changes > 0)
}

fn update_row(conn: &Connection, record: &DownloadRecord) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare_cached(UPDATE_SQL).map_err(StoreError::query)?;
    let changes = stmt
        .execute(params_from_iter(record_to_row(record)))
        .map_err(StoreError::query)?;
    if changes == 0 {
        tracing::debug!(id = record.id, "Update skipped, no such download");
        return Ok(false);
    }
    tags::sync_record(conn, record).map_err(StoreError::query)?;
    Ok(true)
}

fn update_rows(conn: &Connection, records: &[DownloadRecord]) -> Result<usize, StoreError> {
    let mut updated = 0;
    for record in records {
        if update_row(conn, record)? {
            updated += 1;
        }
    }
    Ok(updated)
}

fn select_where<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<DownloadRecord>, StoreError> {
    let mut stmt = conn
        .prepare_cached(&format!("SELECT {COLUMNS} FROM requests WHERE {clause}"))
        .map_err(StoreError::query)?;
    let records = stmt
        .query_map(params, row_to_record)
        .map_err(StoreError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::query)?;
    Ok(records)
}

fn select_one<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Option<DownloadRecord>, StoreError> {
    conn.prepare_cached(&format!("SELECT {COLUMNS} FROM requests WHERE {clause}"))
        .and_then(|mut stmt| stmt.query_row(params, row_to_record).optional())
        .map_err(StoreError::query)
}

fn select_by_ids(conn: &Connection, ids: &[i32]) -> Result<Vec<DownloadRecord>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let clause = format!("id IN ({})", placeholders(ids.len()));
    let found = select_where(conn, &clause, params_from_iter(ids))?;
    let mut by_id: BTreeMap<i32, DownloadRecord> =
        found.into_iter().map(|r| (r.id, r)).collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_codes(statuses: &[Status]) -> impl Iterator<Item = i32> + '_ {
    statuses.iter().map(|s| s.as_i32())
}

fn retain_statuses(records: Vec<DownloadRecord>, statuses: &[Status]) -> Vec<DownloadRecord> {
    records
        .into_iter()
        .filter(|r| statuses.contains(&r.status))
        .collect()
}

/// Encode a record as the positional row used by INSERT and UPDATE.
///
/// Position 1 is the id; the rest follow [`COLUMNS`].
fn record_to_row(record: &DownloadRecord) -> [Value; 20] {
    [
        Value::Integer(i64::from(record.id)),
        Value::Text(record.namespace.clone()),
        Value::Text(record.url.clone()),
        Value::Text(record.file.clone()),
        Value::Integer(i64::from(record.group)),
        Value::Integer(i64::from(record.priority.as_i32())),
        Value::Text(codec::encode(&record.headers)),
        Value::Integer(record.downloaded),
        Value::Integer(record.total),
        Value::Integer(i64::from(record.status.as_i32())),
        Value::Text(codec::encode(&record.error)),
        Value::Integer(i64::from(record.network_type.as_i32())),
        Value::Integer(record.created.timestamp_millis()),
        record.tag.clone().map_or(Value::Null, Value::Text),
        Value::Integer(i64::from(record.enqueue_action.as_i32())),
        Value::Integer(record.identifier),
        Value::Integer(i64::from(record.download_on_enqueue)),
        Value::Text(codec::encode(&record.extras)),
        Value::Integer(i64::from(record.auto_retry_max_attempts)),
        Value::Integer(i64::from(record.auto_retry_attempts)),
    ]
}

/// Convert a database row to a DownloadRecord.
///
/// Unknown enum codes and undecodable blobs fall back to defaults so one
/// bad row cannot fail a whole read.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let headers: String = row.get(6)?;
    let error: String = row.get(10)?;
    let created_ms: i64 = row.get(12)?;
    let extras: String = row.get(17)?;

    Ok(DownloadRecord {
        id: row.get(0)?,
        namespace: row.get(1)?,
        url: row.get(2)?,
        file: row.get(3)?,
        group: row.get(4)?,
        priority: Priority::from_i32(row.get(5)?).unwrap_or_default(),
        headers: codec::decode_or_default(&headers),
        downloaded: row.get(7)?,
        total: row.get(8)?,
        status: Status::from_i32(row.get(9)?).unwrap_or(Status::None),
        error: codec::decode(&error).unwrap_or(ErrorPayload {
            code: ErrorPayload::UNKNOWN_CODE,
            response: None,
        }),
        network_type: NetworkType::from_i32(row.get(11)?).unwrap_or_default(),
        created: Utc
            .timestamp_millis_opt(created_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        tag: row.get(13)?,
        enqueue_action: EnqueueAction::from_i32(row.get(14)?).unwrap_or_default(),
        identifier: row.get(15)?,
        download_on_enqueue: row.get(16)?,
        extras: codec::decode_or_default(&extras),
        auto_retry_max_attempts: row.get(18)?,
        auto_retry_attempts: row.get(19)?,
        tags: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Weak};
    use std::time::Duration;

    use chrono::SubsecRound;

    use super::*;

    #[derive(Default)]
    struct RecordingDelegate {
        cleaned: Mutex<Vec<i32>>,
    }

    impl StoreDelegate for RecordingDelegate {
        fn delete_temp_files_for_download(&self, record: &DownloadRecord) {
            self.cleaned.lock().unwrap().push(record.id);
        }
    }

    struct AbsentFiles {
        calls: AtomicUsize,
    }

    impl FileProbe for AbsentFiles {
        fn exists(&self, _path: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn store() -> DownloadStore {
        DownloadStore::open_in_memory("test").unwrap()
    }

    fn record(id: i32) -> DownloadRecord {
        let mut record = DownloadRecord::new(
            id,
            format!("https://example.com/{id}.bin"),
            format!("/downloads/{id}.bin"),
        );
        record.namespace = "test".to_string();
        record.status = Status::Queued;
        record
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("download_store_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_open_creates_db() {
        let dir = test_dir("open_creates");
        let config = StoreConfig::new("queue", &dir);
        let store = DownloadStore::open(&config).unwrap();
        assert!(dir.join("queue.db").exists());
        assert_eq!(store.path(), dir.join("queue.db"));
        assert!(store.close().is_applied());
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let store = store();
        let mut rec = record(1);
        rec.headers.insert("Range".to_string(), "bytes=0-".to_string());
        rec.extras.insert("origin", "share-sheet");
        rec.error = ErrorPayload::new(7, Some(serde_json::json!({"status": 404})));
        rec.tags.insert("video".to_string());
        rec.identifier = 99;
        rec.priority = Priority::High;

        let (returned, inserted) = store.insert(rec.clone()).unwrap();
        assert!(inserted);
        assert_eq!(returned, rec);

        let loaded = store.get(1).unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let store = store();
        let first = record(1);
        store.insert(first.clone()).unwrap();

        let mut second = record(1);
        second.url = "https://example.com/other".to_string();
        second.file = "/downloads/other.bin".to_string();
        let (_, inserted) = store.insert(second).unwrap();
        assert!(!inserted);

        let loaded = store.get(1).unwrap().unwrap();
        assert_eq!(loaded.url, first.url);
        assert_eq!(loaded.file, first.file);
    }

    #[test]
    fn test_insert_rejects_duplicate_file() {
        let store = store();
        store.insert(record(1)).unwrap();
        let mut clash = record(2);
        clash.file = record(1).file;
        let (_, inserted) = store.insert(clash).unwrap();
        assert!(!inserted);
        assert!(store.get(2).unwrap().is_none());
    }

    #[test]
    fn test_insert_batch_reports_per_row() {
        let store = store();
        store.insert(record(2)).unwrap();

        let results = store
            .insert_batch(vec![record(1), record(2), record(3)])
            .unwrap();
        let flags: Vec<(i32, bool)> = results.iter().map(|(r, ok)| (r.id, *ok)).collect();
        assert_eq!(flags, vec![(1, true), (2, false), (3, true)]);
        assert_eq!(store.get_all().unwrap().len(), 3);
    }

    #[test]
    fn test_update_missing_id_is_noop() {
        let store = store();
        assert!(!store.update(&record(42)).unwrap());
        assert!(store.get(42).unwrap().is_none());
    }

    #[test]
    fn test_update_persists_fields_and_tags() {
        let store = store();
        store.insert(record(1)).unwrap();

        let mut rec = record(1);
        rec.status = Status::Paused;
        rec.group = 7;
        rec.tags.insert("later".to_string());
        assert!(store.update(&rec).unwrap());

        let loaded = store.get(1).unwrap().unwrap();
        assert_eq!(loaded.status, Status::Paused);
        assert_eq!(loaded.group, 7);
        assert!(loaded.tags.contains("later"));
    }

    #[test]
    fn test_update_batch_skips_missing_ids() {
        let store = store();
        store.insert(record(1)).unwrap();
        let mut one = record(1);
        one.status = Status::Paused;
        let updated = store.update_batch(&[one, record(2)]).unwrap();
        assert_eq!(updated, 1);
        assert!(store.get(2).unwrap().is_none());
    }

    #[test]
    fn test_update_progress_and_status() {
        let store = store();
        store.insert(record(1)).unwrap();

        let mut rec = record(1);
        rec.downloaded = 4096;
        rec.total = 8192;
        rec.status = Status::Downloading;
        rec.url = "https://ignored.example.com".to_string();
        let outcome = store.update_progress_and_status(&rec).unwrap();
        assert!(outcome.is_applied());

        let loaded = store.get(1).unwrap().unwrap();
        assert_eq!(loaded.downloaded, 4096);
        assert_eq!(loaded.total, 8192);
        assert_eq!(loaded.status, Status::Downloading);
        assert_eq!(loaded.url, record(1).url);
    }

    #[test]
    fn test_update_progress_reports_storage_failure() {
        let store = store();
        store.insert(record(1)).unwrap();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER block_progress BEFORE UPDATE OF downloaded ON requests
                     BEGIN SELECT RAISE(ABORT, 'progress blocked'); END;",
                )
                .map_err(StoreError::query)
            })
            .unwrap();

        let mut rec = record(1);
        rec.downloaded = 10;
        let outcome = store.update_progress_and_status(&rec).unwrap();
        assert!(!outcome.is_applied());
        assert!(outcome.warnings()[0].contains("progress blocked"));
        assert_eq!(store.get(1).unwrap().unwrap().downloaded, 0);
    }

    #[test]
    fn test_soft_delete_keeps_row() {
        let store = store();
        store.insert(record(1)).unwrap();
        assert!(store.delete(&record(1), true).unwrap());
        let loaded = store.get(1).unwrap().unwrap();
        assert_eq!(loaded.status, Status::Deleted);
    }

    #[test]
    fn test_hard_delete_removes_row_and_refs() {
        let store = store();
        let mut rec = record(1);
        rec.tags.insert("gone".to_string());
        store.insert(rec.clone()).unwrap();

        assert!(store.delete(&rec, false).unwrap());
        assert!(store.get(1).unwrap().is_none());
        assert!(store.get_by_tag("gone").unwrap().is_empty());
        let refs: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM tag_refs", [], |row| row.get(0))
                    .map_err(StoreError::query)
            })
            .unwrap();
        assert_eq!(refs, 0);
    }

    #[test]
    fn test_delete_batch_and_delete_all() {
        let store = store();
        store
            .insert_batch(vec![record(1), record(2), record(3)])
            .unwrap();
        assert_eq!(store.delete_batch(&[record(1), record(2)], true).unwrap(), 2);
        assert_eq!(store.get_by_status(Status::Deleted).unwrap().len(), 2);

        assert_eq!(store.delete_all().unwrap(), 3);
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_update_extras() {
        let store = store();
        store.insert(record(1)).unwrap();

        let extras: Extras = [("a", "1"), ("b", "2")].into_iter().collect();
        let updated = store.update_extras(1, &extras).unwrap().unwrap();
        assert_eq!(updated.extras, extras);
        assert!(store.update_extras(2, &extras).unwrap().is_none());
    }

    #[test]
    fn test_delete_extra_by_key() {
        let store = store();
        let mut rec = record(1);
        rec.extras.insert("keep", "x");
        rec.extras.insert("drop", "y");
        store.insert(rec).unwrap();

        let updated = store.delete_extra_by_key(1, "drop").unwrap().unwrap();
        assert_eq!(updated.extras.get("keep"), Some("x"));
        assert!(!updated.extras.contains_key("drop"));
        assert!(!store.get(1).unwrap().unwrap().extras.contains_key("drop"));
        assert!(store.delete_extra_by_key(9, "drop").unwrap().is_none());
    }

    #[test]
    fn test_delete_extras_by_key_many() {
        let store = store();
        for id in 1..=2 {
            let mut rec = record(id);
            rec.extras.insert("token", "secret");
            store.insert(rec).unwrap();
        }
        let updated = store.delete_extras_by_key(&[1, 2, 3], "token").unwrap();
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|r| r.extras.is_empty()));
    }

    #[test]
    fn test_update_priority() {
        let store = store();
        store.insert_batch(vec![record(1), record(2)]).unwrap();
        let updated = store.update_priority(&[2, 1, 5], Priority::High).unwrap();
        let ids: Vec<i32> = updated.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(store
            .get_all()
            .unwrap()
            .iter()
            .all(|r| r.priority == Priority::High));
    }

    #[test]
    fn test_get_many_keeps_request_order() {
        let store = store();
        store
            .insert_batch(vec![record(1), record(2), record(3)])
            .unwrap();
        let ids: Vec<i32> = store
            .get_many(&[3, 9, 1])
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![3, 1]);
        assert!(store.get_many(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_get_by_file() {
        let store = store();
        store.insert(record(1)).unwrap();
        let found = store.get_by_file("/downloads/1.bin").unwrap().unwrap();
        assert_eq!(found.id, 1);
        assert!(store.get_by_file("/downloads/none.bin").unwrap().is_none());
    }

    #[test]
    fn test_get_by_status_and_group() {
        let store = store();
        let mut a = record(1);
        a.group = 10;
        let mut b = record(2);
        b.group = 10;
        b.status = Status::Failed;
        let mut c = record(3);
        c.group = 20;
        store.insert_batch(vec![a, b, c]).unwrap();

        assert_eq!(store.get_by_status(Status::Queued).unwrap().len(), 2);
        assert_eq!(
            store
                .get_by_statuses(&[Status::Queued, Status::Failed])
                .unwrap()
                .len(),
            3
        );
        assert_eq!(store.get_by_group(10).unwrap().len(), 2);
        assert_eq!(store.get_by_groups(&[10, 20]).unwrap().len(), 3);

        let failed_in_10 = store
            .get_by_group_with_statuses(10, &[Status::Failed])
            .unwrap();
        assert_eq!(failed_in_10.len(), 1);
        assert_eq!(failed_in_10[0].id, 2);
        assert_eq!(store.get_all_group_ids().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_get_by_identifier() {
        let store = store();
        let mut a = record(1);
        a.identifier = 500;
        let mut b = record(2);
        b.identifier = 500;
        let mut c = record(3);
        c.identifier = 600;
        store.insert_batch(vec![a, b, c]).unwrap();

        assert_eq!(store.get_by_identifier(500).unwrap().len(), 2);
        assert_eq!(store.get_by_identifiers(&[500, 600]).unwrap().len(), 3);
        assert!(store.get_by_identifier(1).unwrap().is_empty());
    }

    #[test]
    fn test_get_pending_sorted() {
        let store = store();
        let base = Utc::now().trunc_subsecs(3);
        let mut low = record(1);
        low.priority = Priority::Low;
        low.created = base;
        let mut old = record(2);
        old.created = base - chrono::Duration::seconds(60);
        let mut new = record(3);
        new.created = base;
        let mut high = record(4);
        high.priority = Priority::High;
        high.created = base;
        let mut paused = record(5);
        paused.status = Status::Paused;
        store.insert_batch(vec![low, old, new, high, paused]).unwrap();

        let asc: Vec<i32> = store
            .get_pending_sorted(PrioritySort::Asc)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(asc, vec![4, 2, 3, 1]);

        let desc: Vec<i32> = store
            .get_pending_sorted(PrioritySort::Desc)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(desc, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_get_pending_count() {
        let store = store();
        let mut downloading = record(2);
        downloading.status = Status::Downloading;
        let mut added = record(3);
        added.status = Status::Added;
        let mut done = record(4);
        done.status = Status::Completed;
        done.downloaded = 10;
        done.total = 10;
        store
            .insert_batch(vec![record(1), downloading, added, done])
            .unwrap();

        assert_eq!(store.get_pending_count(false).unwrap(), 2);
        assert_eq!(store.get_pending_count(true).unwrap(), 3);
    }

    #[test]
    fn test_get_by_tag() {
        let store = store();
        let mut one = record(1);
        one.tags = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let mut two = record(2);
        two.tags = ["b"].iter().map(|s| s.to_string()).collect();
        store.insert_batch(vec![one, two]).unwrap();

        let b: Vec<i32> = store.get_by_tag("b").unwrap().iter().map(|r| r.id).collect();
        assert_eq!(b, vec![1, 2]);

        let a = store.get_by_tag("a").unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].id, 1);
        assert_eq!(a[0].tags.len(), 2);

        assert!(store.get_by_tag("missing").unwrap().is_empty());
    }

    #[test]
    fn test_get_by_tags_is_union() {
        let store = store();
        let mut one = record(1);
        one.tags = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let mut two = record(2);
        two.tag = Some("c".to_string());
        store.insert_batch(vec![one, two, record(3)]).unwrap();

        let ids: Vec<i32> = store
            .get_by_tags(&["b", "a", "c"])
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_removed_label_keeps_stale_ref() {
        let store = store();
        let mut rec = record(1);
        rec.tags = ["a", "b"].iter().map(|s| s.to_string()).collect();
        store.insert(rec.clone()).unwrap();

        rec.tags.remove("a");
        store.update(&rec).unwrap();
        assert_eq!(store.get_by_tag("a").unwrap().len(), 1);
    }

    #[test]
    fn test_read_sanitizes_and_persists() {
        let store = store();
        let mut rec = record(1);
        rec.status = Status::Completed;
        rec.downloaded = 500;
        rec.total = -1;
        store.insert(rec).unwrap();

        let loaded = store.get_all().unwrap();
        assert_eq!(loaded[0].total, 500);

        let raw: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT total FROM requests WHERE id = 1", [], |row| row.get(0))
                    .map_err(StoreError::query)
            })
            .unwrap();
        assert_eq!(raw, 500);
    }

    #[test]
    fn test_routine_read_leaves_downloading_alone() {
        let store = store();
        let mut rec = record(1);
        rec.status = Status::Downloading;
        rec.downloaded = 1000;
        rec.total = 1000;
        store.insert(rec).unwrap();

        assert_eq!(
            store.get(1).unwrap().unwrap().status,
            Status::Downloading
        );
    }

    #[test]
    fn test_status_query_drops_records_sanitized_away() {
        let store = store();
        let mut rec = record(1);
        rec.status = Status::Downloading;
        rec.downloaded = 1000;
        rec.total = 1000;
        store.insert(rec).unwrap();

        assert!(matches!(
            store.sanitize_on_first_entry().unwrap(),
            ColdStart::Completed { repaired: 1, .. }
        ));
        assert!(store.get_by_status(Status::Downloading).unwrap().is_empty());
        assert_eq!(store.get_by_status(Status::Completed).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_file_resets_progress_and_notifies_once() {
        let delegate = Arc::new(RecordingDelegate::default());
        let probe = Arc::new(AbsentFiles {
            calls: AtomicUsize::new(0),
        });
        let store = store()
            .with_delegate(delegate.clone())
            .with_file_probe(probe.clone());

        let mut rec = record(1);
        rec.downloaded = 200;
        rec.total = 1000;
        store.insert(rec).unwrap();

        let loaded = store.get(1).unwrap().unwrap();
        assert_eq!(loaded.downloaded, 0);
        assert_eq!(loaded.total, -1);
        assert_eq!(*delegate.cleaned.lock().unwrap(), vec![1]);

        // Second read finds nothing to repair.
        store.get_all().unwrap();
        assert_eq!(*delegate.cleaned.lock().unwrap(), vec![1]);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_checks_disabled() {
        let delegate = Arc::new(RecordingDelegate::default());
        let store = store()
            .with_delegate(delegate.clone())
            .with_file_probe(Arc::new(AbsentFiles {
                calls: AtomicUsize::new(0),
            }))
            .with_file_exist_checks(false);

        let mut rec = record(1);
        rec.downloaded = 200;
        store.insert(rec).unwrap();

        assert_eq!(store.get(1).unwrap().unwrap().downloaded, 200);
        assert!(delegate.cleaned.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sanitize_on_first_entry_runs_once() {
        let store = store();
        let mut rec = record(1);
        rec.status = Status::Downloading;
        rec.downloaded = 10;
        rec.total = 100;
        store.insert(rec.clone()).unwrap();

        let first = store.sanitize_on_first_entry().unwrap();
        assert_eq!(
            first,
            ColdStart::Completed {
                repaired: 1,
                outcome: Outcome::Applied
            }
        );
        assert_eq!(store.get(1).unwrap().unwrap().status, Status::Queued);

        // A record marked downloading after the cold start stays that way.
        rec.status = Status::Downloading;
        store.update(&rec).unwrap();
        assert_eq!(store.sanitize_on_first_entry().unwrap(), ColdStart::AlreadyDone);
        assert_eq!(store.get(1).unwrap().unwrap().status, Status::Downloading);
    }

    /// Looks the record up again from inside the cleanup callback.
    #[derive(Default)]
    struct ReentrantDelegate {
        store: Mutex<Weak<DownloadStore>>,
        seen: Mutex<Vec<Option<i64>>>,
    }

    impl StoreDelegate for ReentrantDelegate {
        fn delete_temp_files_for_download(&self, record: &DownloadRecord) {
            let store = self.store.lock().unwrap().upgrade();
            if let Some(store) = store {
                let current = store.get_by_file(&record.file).unwrap();
                self.seen.lock().unwrap().push(current.map(|r| r.downloaded));
            }
        }
    }

    fn reentrant_store(delegate: &Arc<ReentrantDelegate>) -> Arc<DownloadStore> {
        let store = Arc::new(
            store()
                .with_delegate(delegate.clone())
                .with_file_probe(Arc::new(AbsentFiles {
                    calls: AtomicUsize::new(0),
                })),
        );
        *delegate.store.lock().unwrap() = Arc::downgrade(&store);
        store
    }

    #[test]
    fn test_delegate_can_read_store_during_cleanup() {
        let delegate = Arc::new(ReentrantDelegate::default());
        let store = reentrant_store(&delegate);

        let mut rec = record(1);
        rec.downloaded = 200;
        rec.total = 1000;
        store.insert(rec).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&store);
        std::thread::spawn(move || {
            let _ = tx.send(worker.get(1).map(|r| r.map(|r| r.downloaded)));
        });
        let loaded = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("read blocked while notifying the delegate")
            .unwrap();

        assert_eq!(loaded, Some(0));
        assert_eq!(*delegate.seen.lock().unwrap(), vec![Some(0)]);
    }

    #[test]
    fn test_delegate_can_read_store_during_cold_start() {
        let delegate = Arc::new(ReentrantDelegate::default());
        let store = reentrant_store(&delegate);

        let mut rec = record(1);
        rec.status = Status::Downloading;
        rec.downloaded = 10;
        rec.total = 100;
        store.insert(rec).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&store);
        std::thread::spawn(move || {
            let _ = tx.send(worker.sanitize_on_first_entry());
        });
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("cold start blocked while notifying the delegate")
            .unwrap();

        assert!(matches!(result, ColdStart::Completed { repaired: 1, .. }));
        assert_eq!(*delegate.seen.lock().unwrap(), vec![Some(0)]);
    }

    #[test]
    fn test_sanitize_write_back_failure_is_logged_not_returned() {
        let store = store();
        let mut rec = record(1);
        rec.status = Status::Completed;
        rec.downloaded = 500;
        rec.total = -1;
        store.insert(rec).unwrap();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER block_write_back BEFORE UPDATE ON requests
                     BEGIN SELECT RAISE(ABORT, 'write-back blocked'); END;",
                )
                .map_err(StoreError::query)
            })
            .unwrap();

        let loaded = store.get_all().unwrap();
        assert_eq!(loaded[0].total, 500);
        assert_eq!(loaded[0].downloaded, 500);

        let raw: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT total FROM requests WHERE id = 1", [], |row| row.get(0))
                    .map_err(StoreError::query)
            })
            .unwrap();
        assert_eq!(raw, -1);

        let ColdStart::Completed { repaired, outcome } = store.sanitize_on_first_entry().unwrap()
        else {
            panic!("cold start should run on the first call");
        };
        assert_eq!(repaired, 1);
        assert!(matches!(outcome, Outcome::Degraded { .. }));
        assert!(outcome.warnings()[0].contains("write-back blocked"));
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = store();
        store.insert(record(1)).unwrap();
        assert!(store.close().is_applied());
        assert!(store.is_closed());

        assert!(store.insert(record(2)).unwrap_err().is_closed());
        assert!(store.get(1).unwrap_err().is_closed());
        assert!(store.update(&record(1)).unwrap_err().is_closed());
        assert!(store.get_all().unwrap_err().is_closed());
        assert!(store.update_progress_and_status(&record(1)).unwrap_err().is_closed());
        assert!(store.sanitize_on_first_entry().unwrap_err().is_closed());
        assert!(store.get_pending_count(true).unwrap_err().is_closed());

        let message = store.delete_all().unwrap_err().to_string();
        assert_eq!(message, "test database is closed");
    }

    #[test]
    fn test_close_twice_is_noop() {
        let store = store();
        assert!(store.close().is_applied());
        assert!(store.close().is_applied());
        assert!(store.is_closed());
    }

    #[test]
    fn test_shared_across_threads() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.insert(record(t * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_all().unwrap().len(), 100);
    }

    #[test]
    fn test_undecodable_blobs_fall_back() {
        let store = store();
        store.insert(record(1)).unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE requests SET headers = 'oops', extras = '{bad', error = '' WHERE id = 1",
                    [],
                )
                .map_err(StoreError::query)
            })
            .unwrap();

        let loaded = store.get(1).unwrap().unwrap();
        assert!(loaded.headers.is_empty());
        assert!(loaded.extras.is_empty());
        assert_eq!(loaded.error.code, ErrorPayload::UNKNOWN_CODE);
    }
}
