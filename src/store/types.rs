//! Types for the download store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a download, stored as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    None,
    Queued,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
    Removed,
    Deleted,
    Added,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::None,
        Status::Queued,
        Status::Downloading,
        Status::Paused,
        Status::Completed,
        Status::Cancelled,
        Status::Failed,
        Status::Removed,
        Status::Deleted,
        Status::Added,
    ];

    /// Convert to the code stored in the database.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Queued => 1,
            Self::Downloading => 2,
            Self::Paused => 3,
            Self::Completed => 4,
            Self::Cancelled => 5,
            Self::Failed => 6,
            Self::Removed => 7,
            Self::Deleted => 8,
            Self::Added => 9,
        }
    }

    /// Parse from the code stored in the database.
    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_i32() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Removed => "removed",
            Self::Deleted => "deleted",
            Self::Added => "added",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Higher priorities are picked first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Low => -1,
            Self::Normal => 0,
            Self::High => 1,
        }
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Low),
            0 => Some(Self::Normal),
            1 => Some(Self::High),
            _ => None,
        }
    }
}

/// Network constraint a transfer is allowed to run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    GlobalOff,
    #[default]
    All,
    WifiOnly,
    Unmetered,
}

impl NetworkType {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::GlobalOff => -1,
            Self::All => 0,
            Self::WifiOnly => 1,
            Self::Unmetered => 2,
        }
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::GlobalOff),
            0 => Some(Self::All),
            1 => Some(Self::WifiOnly),
            2 => Some(Self::Unmetered),
            _ => None,
        }
    }
}

/// What the enqueuer does when a download for the same file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EnqueueAction {
    #[default]
    ReplaceExisting,
    IncrementFileName,
    DoNotEnqueueIfExisting,
    UpdateAccordingly,
}

impl EnqueueAction {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::ReplaceExisting => 0,
            Self::IncrementFileName => 1,
            Self::DoNotEnqueueIfExisting => 2,
            Self::UpdateAccordingly => 3,
        }
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::ReplaceExisting),
            1 => Some(Self::IncrementFileName),
            2 => Some(Self::DoNotEnqueueIfExisting),
            3 => Some(Self::UpdateAccordingly),
            _ => None,
        }
    }
}

/// Ordering of pending downloads by creation time. Priority always sorts
/// high-to-low first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrioritySort {
    #[default]
    Asc,
    Desc,
}

/// Error attached to a download, persisted as a JSON blob.
///
/// `response` holds whatever the transfer engine captured from the server
/// (status line, headers, body excerpt); it is opaque to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "key")]
    pub code: i32,
    #[serde(rename = "message", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl ErrorPayload {
    /// Code meaning "no error".
    pub const NONE_CODE: i32 = 0;
    /// Code for an error the transfer engine could not classify.
    pub const UNKNOWN_CODE: i32 = -1;

    pub fn none() -> Self {
        Self {
            code: Self::NONE_CODE,
            response: None,
        }
    }

    pub fn new(code: i32, response: Option<serde_json::Value>) -> Self {
        Self { code, response }
    }

    pub fn is_none(&self) -> bool {
        self.code == Self::NONE_CODE && self.response.is_none()
    }
}

impl Default for ErrorPayload {
    fn default() -> Self {
        Self::none()
    }
}

/// Free-form string metadata attached to a download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extras(BTreeMap<String, String>);

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove_by_key(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Extras {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A persisted download.
///
/// Records are plain values: readers get owned copies, and nothing in the
/// store holds on to a record after a call returns.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRecord {
    /// Caller-assigned primary key.
    pub id: i32,
    pub namespace: String,
    /// Source URL.
    pub url: String,
    /// Destination path on disk.
    pub file: String,
    pub group: i32,
    pub priority: Priority,
    /// Request headers sent with the transfer.
    pub headers: BTreeMap<String, String>,
    /// Bytes written so far.
    pub downloaded: i64,
    /// Expected size in bytes, or -1 when unknown.
    pub total: i64,
    pub status: Status,
    pub error: ErrorPayload,
    pub network_type: NetworkType,
    pub created: DateTime<Utc>,
    /// Single tag from before tag sets existed. Only consulted when `tags`
    /// is empty.
    pub tag: Option<String>,
    pub enqueue_action: EnqueueAction,
    /// Caller-side request identifier; several records may share one.
    pub identifier: i64,
    pub download_on_enqueue: bool,
    pub extras: Extras,
    pub auto_retry_max_attempts: i32,
    pub auto_retry_attempts: i32,
    /// Labels attached through the tag index.
    pub tags: BTreeSet<String>,
}

impl DownloadRecord {
    /// Create a record with storage defaults.
    ///
    /// `created` is truncated to milliseconds, the precision it is stored at,
    /// so a freshly built record compares equal to its persisted copy.
    pub fn new(id: i32, url: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            id,
            namespace: String::new(),
            url: url.into(),
            file: file.into(),
            group: 0,
            priority: Priority::Normal,
            headers: BTreeMap::new(),
            downloaded: 0,
            total: -1,
            status: Status::None,
            error: ErrorPayload::none(),
            network_type: NetworkType::All,
            created: Utc::now().trunc_subsecs(3),
            tag: None,
            enqueue_action: EnqueueAction::ReplaceExisting,
            identifier: 0,
            download_on_enqueue: true,
            extras: Extras::new(),
            auto_retry_max_attempts: 0,
            auto_retry_attempts: 0,
            tags: BTreeSet::new(),
        }
    }

    /// Labels this record should be indexed under: the tag set, or the
    /// legacy single tag when the set is empty.
    pub fn effective_tags(&self) -> Vec<&str> {
        if !self.tags.is_empty() {
            self.tags.iter().map(String::as_str).collect()
        } else {
            self.tag.as_deref().into_iter().collect()
        }
    }
}

/// Result of a best-effort write.
///
/// Storage failures on progress updates, sanitization write-back and close
/// are logged and reported here instead of being returned as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Degraded { warnings: Vec<String> },
}

impl Outcome {
    pub(crate) fn from_warnings(warnings: Vec<String>) -> Self {
        if warnings.is_empty() {
            Self::Applied
        } else {
            Self::Degraded { warnings }
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Self::Applied => &[],
            Self::Degraded { warnings } => warnings,
        }
    }
}

/// Result of [`crate::DownloadStore::sanitize_on_first_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdStart {
    /// The pass already ran during this store's lifetime.
    AlreadyDone,
    Completed { repaired: usize, outcome: Outcome },
}
