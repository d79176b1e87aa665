//! Durable record store for a download manager's queue.
//!
//! [`DownloadStore`] persists one [`DownloadRecord`] per download in a
//! per-namespace SQLite database, indexes records by tag, and reconciles
//! records a crash left inconsistent. Calls are synchronous; async callers
//! wrap them in `tokio::task::spawn_blocking`.
//!
//! ```no_run
//! use download_store::config::StoreConfig;
//! use download_store::{DownloadStore, Status};
//!
//! # fn main() -> Result<(), download_store::StoreError> {
//! let store = DownloadStore::open(&StoreConfig::new("photos", "/var/lib/downloads"))?;
//! store.sanitize_on_first_entry()?;
//!
//! let mut record = store.new_record(1, "https://example.com/a.jpg", "/data/a.jpg");
//! record.status = Status::Queued;
//! store.insert(record)?;
//!
//! let queued = store.get_by_status(Status::Queued)?;
//! assert_eq!(queued.len(), 1);
//! store.close();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod store;

pub use config::StoreConfig;
pub use store::{
    ColdStart, DownloadRecord, DownloadStore, EnqueueAction, ErrorPayload, Extras, FileProbe,
    LocalFileProbe, Migration, MigrationPolicy, NetworkType, Outcome, Priority, PrioritySort,
    Status, StoreDelegate, StoreError,
};
