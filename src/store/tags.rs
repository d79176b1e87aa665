//! Tag index: many-to-many labels on downloads.
//!
//! A tag's id is the first eight bytes of the SHA-256 of its text, so the
//! same label maps to the same row across processes and restarts and
//! re-attaching it is an idempotent upsert. Join rows are never pruned here;
//! a label dropped from a record keeps its old ref until the record itself
//! is hard-deleted.

use std::collections::BTreeSet;

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use super::types::DownloadRecord;

/// Deterministic identifier for a tag label.
pub fn tag_id(label: &str) -> i64 {
    let digest = Sha256::digest(label.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Upsert each label and its join row for `record_id`.
pub(crate) fn attach<'a>(
    conn: &Connection,
    record_id: i32,
    labels: impl IntoIterator<Item = &'a str>,
) -> rusqlite::Result<usize> {
    let mut upsert_tag = conn.prepare_cached(
        "INSERT INTO tags (id, name) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
    )?;
    let mut upsert_ref = conn.prepare_cached(
        "INSERT OR REPLACE INTO tag_refs (tag_id, download_id) VALUES (?1, ?2)",
    )?;

    let mut attached = 0;
    for label in labels {
        let id = tag_id(label);
        upsert_tag.execute(rusqlite::params![id, label])?;
        upsert_ref.execute(rusqlite::params![id, record_id])?;
        attached += 1;
    }
    Ok(attached)
}

/// Index `record` under its effective tags.
pub(crate) fn sync_record(conn: &Connection, record: &DownloadRecord) -> rusqlite::Result<()> {
    let labels = record.effective_tags();
    if labels.is_empty() {
        return Ok(());
    }
    let attached = attach(conn, record.id, labels)?;
    tracing::debug!(id = record.id, attached, "Synced tag refs");
    Ok(())
}

/// All labels currently joined to `record_id`.
pub(crate) fn tags_for(conn: &Connection, record_id: i32) -> rusqlite::Result<BTreeSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT t.name FROM tags t
         JOIN tag_refs r ON r.tag_id = t.id
         WHERE r.download_id = ?1",
    )?;
    let tags = stmt
        .query_map([record_id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(tags)
}

/// Replace each record's `tags` with what the index holds for it.
pub(crate) fn enrich(conn: &Connection, records: &mut [DownloadRecord]) -> rusqlite::Result<()> {
    for record in records.iter_mut() {
        record.tags = tags_for(conn, record.id)?;
    }
    Ok(())
}
