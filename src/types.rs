//! Core types for satfetch

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of an item in the download pipeline.
///
/// Stored as lowercase text in the state database. Transitions:
///
/// ```text
///  pending ─► downloading ─► downloaded ─► verified ─► processing ─► processed
///                 │                │            │            │
///                 └────────────────┴──► failed ◄┴────────────┘
/// ```
///
/// `verified` is terminal for download-only jobs, `processed` for jobs with
/// post-processing, `failed` for any exhausted or non-retryable error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Registered, waiting for a worker
    Pending,
    /// Transfer in flight
    Downloading,
    /// Bytes on disk, not yet verified
    Downloaded,
    /// Integrity check passed (or skipped)
    Verified,
    /// Post-processing hook running
    Processing,
    /// Post-processing hook finished
    Processed,
    /// Terminal failure; see the row's error message
    Failed,
}

impl ItemStatus {
    /// Database representation of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Downloading => "downloading",
            ItemStatus::Downloaded => "downloaded",
            ItemStatus::Verified => "verified",
            ItemStatus::Processing => "processing",
            ItemStatus::Processed => "processed",
            ItemStatus::Failed => "failed",
        }
    }

    /// Parse the database representation back into a status
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "downloading" => Some(ItemStatus::Downloading),
            "downloaded" => Some(ItemStatus::Downloaded),
            "verified" => Some(ItemStatus::Verified),
            "processing" => Some(ItemStatus::Processing),
            "processed" => Some(ItemStatus::Processed),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    /// True for statuses a later run never re-downloads
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, ItemStatus::Verified | ItemStatus::Processed)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Stored as TEXT; these impls let ItemRecord derive FromRow directly.
impl sqlx::Type<sqlx::Sqlite> for ItemStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ItemStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.as_str().to_owned(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ItemStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        ItemStatus::parse(s).ok_or_else(|| format!("unknown item status: {s}").into())
    }
}

/// Per-item state row.
///
/// Identified by the composite key `(item_id, job_name)`. In sub-entry mode
/// `item_id` carries an encoded `::entry::` suffix; the catalog's id space
/// does not contain that sequence.
#[derive(Debug, Clone, FromRow)]
pub struct ItemRecord {
    /// Catalog item identifier (possibly entry-encoded)
    pub item_id: String,
    /// Job this row belongs to
    pub job_name: String,
    /// Collection the item came from
    pub collection: String,
    /// Expected size in kilobytes as reported by the catalog (0 if unknown)
    pub size_kb: f64,
    /// Expected MD5 digest (empty if the catalog did not report one)
    pub md5: String,
    /// Bytes transferred so far
    pub bytes_downloaded: i64,
    /// Current pipeline status
    pub status: ItemStatus,
    /// On-disk path of the transferred artifact
    pub download_path: String,
    /// Last error message
    pub error_message: String,
    /// RFC 3339 creation timestamp (set on first insert)
    pub created_at: String,
    /// RFC 3339 last-update timestamp
    pub updated_at: String,
}

impl ItemRecord {
    /// New pending record with empty mutable fields
    pub fn new(
        item_id: impl Into<String>,
        job_name: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            job_name: job_name.into(),
            collection: collection.into(),
            size_kb: 0.0,
            md5: String::new(),
            bytes_downloaded: 0,
            status: ItemStatus::Pending,
            download_path: String::new(),
            error_message: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// Set the expected size in kilobytes
    pub fn with_size_kb(mut self, size_kb: f64) -> Self {
        self.size_kb = size_kb;
        self
    }

    /// Set the expected MD5 digest
    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = md5.into();
        self
    }
}

/// Metadata cached for every item returned by the most recent search.
///
/// Lets a resumed session recognize its work scope without redoing the
/// full catalog search.
#[derive(Debug, Clone, FromRow)]
pub struct SearchCacheRow {
    /// Catalog item identifier
    pub item_id: String,
    /// Collection the item came from
    pub collection: String,
    /// Size in kilobytes
    pub size_kb: f64,
    /// Sensing-start timestamp as reported by the catalog
    pub sensing_start: String,
    /// Sensing-end timestamp as reported by the catalog
    pub sensing_end: String,
    /// RFC 3339 time the row was cached
    pub cached_at: String,
}

/// Metadata for a new search-cache entry (cached_at is set on insert)
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    /// Catalog item identifier
    pub item_id: String,
    /// Collection the item came from
    pub collection: String,
    /// Size in kilobytes
    pub size_kb: f64,
    /// Sensing-start timestamp
    pub sensing_start: String,
    /// Sensing-end timestamp
    pub sensing_end: String,
}

/// Event emitted during pipeline execution.
///
/// Consumers subscribe via a broadcast channel; progress rendering lives
/// outside the crate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job started executing
    JobStarted {
        /// Job name
        job: String,
        /// Session id for the job
        session_id: String,
    },

    /// A job finished (successfully or not)
    JobFinished {
        /// Job name
        job: String,
    },

    /// An item transfer started
    ItemStarted {
        /// State-row key
        item: String,
    },

    /// Bytes arrived for an item
    ItemProgress {
        /// State-row key
        item: String,
        /// Total bytes transferred so far in this attempt
        bytes: u64,
    },

    /// An item reached a terminal success status
    ItemCompleted {
        /// State-row key
        item: String,
        /// Final on-disk path (empty in remote mode)
        path: String,
    },

    /// An item reached `failed`
    ItemFailed {
        /// State-row key
        item: String,
        /// Failure message recorded on the row
        error: String,
    },

    /// Cooperative shutdown was requested
    ShutdownRequested,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        let all = [
            ItemStatus::Pending,
            ItemStatus::Downloading,
            ItemStatus::Downloaded,
            ItemStatus::Verified,
            ItemStatus::Processing,
            ItemStatus::Processed,
            ItemStatus::Failed,
        ];
        for status in all {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_status_string_parses_to_none() {
        assert_eq!(ItemStatus::parse("queued"), None);
        assert_eq!(ItemStatus::parse(""), None);
    }

    #[test]
    fn terminal_success_covers_verified_and_processed_only() {
        assert!(ItemStatus::Verified.is_terminal_success());
        assert!(ItemStatus::Processed.is_terminal_success());
        assert!(!ItemStatus::Failed.is_terminal_success());
        assert!(!ItemStatus::Pending.is_terminal_success());
        assert!(!ItemStatus::Downloading.is_terminal_success());
    }

    #[test]
    fn new_record_defaults_to_pending() {
        let rec = ItemRecord::new("P1", "job", "C1").with_size_kb(10.0).with_md5("abc");
        assert_eq!(rec.status, ItemStatus::Pending);
        assert_eq!(rec.size_kb, 10.0);
        assert_eq!(rec.md5, "abc");
        assert!(rec.created_at.is_empty());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::ItemFailed {
            item: "P1".into(),
            error: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item_failed");
        assert_eq!(json["item"], "P1");
    }
}
