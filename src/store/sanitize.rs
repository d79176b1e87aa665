//! State reconciliation for persisted downloads.
//!
//! Records read back after a crash can claim states that no longer hold: a
//! transfer marked downloading when no process is running it, progress
//! counted against a file that has since been deleted, a completed download
//! whose total was never learned. [`sanitize`] repairs these in memory and
//! reports which records changed; persisting the repairs and notifying the
//! delegate is the store's job.

use std::path::Path;

use super::types::{DownloadRecord, ErrorPayload, Status};

/// Answers whether a destination file is present on disk.
pub trait FileProbe: Send + Sync {
    fn exists(&self, path: &str) -> bool;
}

/// [`FileProbe`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileProbe;

impl FileProbe for LocalFileProbe {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

/// Owner-side hooks invoked by the store.
pub trait StoreDelegate: Send + Sync {
    /// Progress for `record` was discarded; remove its partial and temporary
    /// files. Fire-and-forget: the store does not wait on or inspect the
    /// result.
    fn delete_temp_files_for_download(&self, record: &DownloadRecord);
}

/// Parameters of one sanitization pass.
#[derive(Clone, Copy)]
pub struct SanitizePass<'a> {
    /// Cold-start pass: downloads marked downloading are settled.
    pub first_entry: bool,
    /// Set when file-existence checks are enabled.
    pub file_probe: Option<&'a dyn FileProbe>,
}

impl<'a> SanitizePass<'a> {
    pub fn routine(file_probe: Option<&'a dyn FileProbe>) -> Self {
        Self {
            first_entry: false,
            file_probe,
        }
    }

    pub fn first_entry(file_probe: Option<&'a dyn FileProbe>) -> Self {
        Self {
            first_entry: true,
            file_probe,
        }
    }
}

/// What a pass did to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    Unchanged,
    /// Status, total or error was corrected.
    Repaired,
    /// Progress was reset because the destination file is gone.
    StaleProgressDiscarded,
}

/// Output of [`sanitize`]: the records plus per-record repairs, index-aligned.
#[derive(Debug, Clone)]
pub struct Sanitized {
    pub records: Vec<DownloadRecord>,
    pub repairs: Vec<Repair>,
}

impl Sanitized {
    pub fn is_changed(&self) -> bool {
        self.repairs.iter().any(|r| *r != Repair::Unchanged)
    }

    pub fn changed_count(&self) -> usize {
        self.repairs
            .iter()
            .filter(|r| **r != Repair::Unchanged)
            .count()
    }

    pub fn changed(&self) -> impl Iterator<Item = &DownloadRecord> {
        self.records
            .iter()
            .zip(&self.repairs)
            .filter(|(_, repair)| **repair != Repair::Unchanged)
            .map(|(record, _)| record)
    }

    /// Records whose temporary files should be cleaned up.
    pub fn stale(&self) -> impl Iterator<Item = &DownloadRecord> {
        self.records
            .iter()
            .zip(&self.repairs)
            .filter(|(_, repair)| **repair == Repair::StaleProgressDiscarded)
            .map(|(record, _)| record)
    }
}

/// Reconcile a batch of records.
pub fn sanitize(mut records: Vec<DownloadRecord>, pass: &SanitizePass<'_>) -> Sanitized {
    let repairs = records
        .iter_mut()
        .map(|record| reconcile(record, pass))
        .collect();
    Sanitized { records, repairs }
}

/// Apply the status rules until the status stops moving, so a record settled
/// from downloading to queued also gets the queued checks in the same pass.
fn reconcile(record: &mut DownloadRecord, pass: &SanitizePass<'_>) -> Repair {
    let mut result = Repair::Unchanged;
    loop {
        let status = record.status;
        let step = match status {
            Status::Completed => on_completed(record),
            Status::Downloading => on_downloading(record, pass.first_entry),
            Status::Queued | Status::Paused => on_paused(record, pass.file_probe),
            Status::Cancelled
            | Status::Failed
            | Status::Added
            | Status::None
            | Status::Deleted
            | Status::Removed => Repair::Unchanged,
        };
        result = merge(result, step);
        if record.status == status {
            return result;
        }
    }
}

fn merge(a: Repair, b: Repair) -> Repair {
    match (a, b) {
        (Repair::StaleProgressDiscarded, _) | (_, Repair::StaleProgressDiscarded) => {
            Repair::StaleProgressDiscarded
        }
        (Repair::Repaired, _) | (_, Repair::Repaired) => Repair::Repaired,
        _ => Repair::Unchanged,
    }
}

/// A transfer that finished before its size was known takes its byte count
/// as the total.
fn on_completed(record: &mut DownloadRecord) -> Repair {
    if record.total < 1 && record.downloaded > 0 {
        record.total = record.downloaded;
        record.error = ErrorPayload::none();
        Repair::Repaired
    } else {
        Repair::Unchanged
    }
}

/// Nothing is downloading right after a restart: the record is either done
/// or goes back to the queue.
fn on_downloading(record: &mut DownloadRecord, first_entry: bool) -> Repair {
    if !first_entry {
        return Repair::Unchanged;
    }
    record.status = if record.downloaded > 0
        && record.total > 0
        && record.downloaded >= record.total
    {
        Status::Completed
    } else {
        Status::Queued
    };
    record.error = ErrorPayload::none();
    Repair::Repaired
}

/// Progress counted against a missing file cannot be resumed.
fn on_paused(record: &mut DownloadRecord, file_probe: Option<&dyn FileProbe>) -> Repair {
    let Some(probe) = file_probe else {
        return Repair::Unchanged;
    };
    if record.downloaded > 0 && !probe.exists(&record.file) {
        record.downloaded = 0;
        record.total = -1;
        record.error = ErrorPayload::none();
        Repair::StaleProgressDiscarded
    } else {
        Repair::Unchanged
    }
}
