use std::path::PathBuf;

use crate::store::MigrationPolicy;

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Where and how a [`crate::DownloadStore`] opens its database.
///
/// Each namespace gets its own database file, `<directory>/<namespace>.db`,
/// so separate queues never share state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub namespace: String,
    pub directory: PathBuf,
    pub migration_policy: MigrationPolicy,
    /// Check destination files during sanitization and discard progress
    /// whose file is gone.
    pub file_exist_checks_enabled: bool,
}

impl StoreConfig {
    pub fn new(namespace: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            directory: directory.into(),
            migration_policy: MigrationPolicy::default(),
            file_exist_checks_enabled: true,
        }
    }

    /// Build from user-facing strings, expanding a leading `~/`.
    pub fn from_user_paths(namespace: &str, directory: &str) -> Self {
        Self::new(namespace, expand_tilde(directory))
    }

    pub fn with_migration_policy(mut self, policy: MigrationPolicy) -> Self {
        self.migration_policy = policy;
        self
    }

    pub fn with_file_exist_checks(mut self, enabled: bool) -> Self {
        self.file_exist_checks_enabled = enabled;
        self
    }

    /// Get the database path for this namespace.
    pub fn database_path(&self) -> PathBuf {
        self.directory.join(format!("{}.db", self.namespace))
    }

    /// Paths of the write-ahead log and shared-memory files SQLite keeps
    /// next to the database.
    pub fn sidecar_paths(&self) -> [PathBuf; 2] {
        let db_path = self.database_path();
        [
            db_path.with_extension("db-wal"),
            db_path.with_extension("db-shm"),
        ]
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
