//! Per-item state row operations.

use crate::error::{DatabaseError, Error, Result};
use crate::types::{ItemRecord, ItemStatus};

use super::Database;

/// Optional column assignments applied together with a status change.
///
/// Unset fields keep their prior values; the whole update is one atomic
/// statement.
#[derive(Debug, Clone, Default)]
pub struct StatusExtra {
    /// New on-disk artifact path
    pub download_path: Option<String>,
    /// New transferred-byte count
    pub bytes_downloaded: Option<i64>,
    /// New error message
    pub error_message: Option<String>,
}

impl StatusExtra {
    /// Extra carrying only an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Database {
    /// Get a state row by item id and job name
    pub async fn get(&self, item_id: &str, job_name: &str) -> Result<Option<ItemRecord>> {
        let row = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT
                item_id, job_name, collection, size_kb, md5,
                bytes_downloaded, status, download_path,
                error_message, created_at, updated_at
            FROM items
            WHERE item_id = ? AND job_name = ?
            "#,
        )
        .bind(item_id)
        .bind(job_name)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get item: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Insert or update a state row.
    ///
    /// `created_at` is set on first insert only; `updated_at` always.
    pub async fn upsert(&self, record: &ItemRecord) -> Result<()> {
        let now = now_rfc3339();
        let created_at = if record.created_at.is_empty() {
            now.clone()
        } else {
            record.created_at.clone()
        };

        sqlx::query(
            r#"
            INSERT INTO items (
                item_id, job_name, collection, size_kb, md5,
                bytes_downloaded, status, download_path,
                error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id, job_name) DO UPDATE SET
                size_kb = excluded.size_kb,
                md5 = excluded.md5,
                bytes_downloaded = excluded.bytes_downloaded,
                status = excluded.status,
                download_path = excluded.download_path,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.item_id)
        .bind(&record.job_name)
        .bind(&record.collection)
        .bind(record.size_kb)
        .bind(&record.md5)
        .bind(record.bytes_downloaded)
        .bind(record.status)
        .bind(&record.download_path)
        .bind(&record.error_message)
        .bind(created_at)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert item: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Atomically update the status (and any extras) of one row
    pub async fn update_status(
        &self,
        item_id: &str,
        job_name: &str,
        status: ItemStatus,
        extra: StatusExtra,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE items SET
                status = ?,
                updated_at = ?,
                download_path = COALESCE(?, download_path),
                bytes_downloaded = COALESCE(?, bytes_downloaded),
                error_message = COALESCE(?, error_message)
            WHERE item_id = ? AND job_name = ?
            "#,
        )
        .bind(status)
        .bind(now_rfc3339())
        .bind(extra.download_path)
        .bind(extra.bytes_downloaded)
        .bind(extra.error_message)
        .bind(item_id)
        .bind(job_name)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update status: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// All rows of a job with the given status
    pub async fn by_status(&self, job_name: &str, status: ItemStatus) -> Result<Vec<ItemRecord>> {
        let rows = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT
                item_id, job_name, collection, size_kb, md5,
                bytes_downloaded, status, download_path,
                error_message, created_at, updated_at
            FROM items
            WHERE job_name = ? AND status = ?
            "#,
        )
        .bind(job_name)
        .bind(status)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list items by status: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// All rows of a job
    pub async fn all(&self, job_name: &str) -> Result<Vec<ItemRecord>> {
        let rows = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT
                item_id, job_name, collection, size_kb, md5,
                bytes_downloaded, status, download_path,
                error_message, created_at, updated_at
            FROM items
            WHERE job_name = ?
            "#,
        )
        .bind(job_name)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list items: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Rows that still need downloading: `pending`, `downloading`, `failed`.
    ///
    /// `downloading` is included because a killed process leaves rows in
    /// that state; they must be retried on the next run.
    pub async fn resumable(&self, job_name: &str) -> Result<Vec<ItemRecord>> {
        let rows = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT
                item_id, job_name, collection, size_kb, md5,
                bytes_downloaded, status, download_path,
                error_message, created_at, updated_at
            FROM items
            WHERE job_name = ? AND status IN (?, ?, ?)
            "#,
        )
        .bind(job_name)
        .bind(ItemStatus::Pending)
        .bind(ItemStatus::Downloading)
        .bind(ItemStatus::Failed)
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list resumable items: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Flip every `downloading` row of the job back to `pending`.
    ///
    /// Runs at session resume before any download work; returns the number
    /// of rows reset.
    pub async fn reset_stale(&self, job_name: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE items SET status = ?, updated_at = ? WHERE job_name = ? AND status = ?",
        )
        .bind(ItemStatus::Pending)
        .bind(now_rfc3339())
        .bind(job_name)
        .bind(ItemStatus::Downloading)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reset stale items: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }
}
