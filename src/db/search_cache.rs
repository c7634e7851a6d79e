//! Search-cache operations.
//!
//! The cache records minimal metadata for every item the most recent
//! search returned, so a resumed session can recognize its work scope
//! without redoing the full catalog search.

use crate::error::{DatabaseError, Error, Result};
use crate::types::{NewCacheEntry, SearchCacheRow};

use super::Database;

impl Database {
    /// Bulk upsert search-result metadata into the cache
    pub async fn cache_search_results(&self, entries: &[NewCacheEntry]) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();

        let mut tx = self.pool().begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin cache transaction: {}",
                e
            )))
        })?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO search_cache
                    (item_id, collection, size_kb, sensing_start, sensing_end, cached_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.item_id)
            .bind(&entry.collection)
            .bind(entry.size_kb)
            .bind(&entry.sensing_start)
            .bind(&entry.sensing_end)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to cache search result: {}",
                    e
                )))
            })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit cache transaction: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// True when the search cache holds any rows
    pub async fn has_cached_search(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_cache")
            .fetch_one(self.pool())
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count search cache: {}",
                    e
                )))
            })?;

        Ok(count > 0)
    }

    /// All cached search-result metadata
    pub async fn cached_search_results(&self) -> Result<Vec<SearchCacheRow>> {
        let rows = sqlx::query_as::<_, SearchCacheRow>(
            r#"
            SELECT item_id, collection, size_kb, sensing_start, sensing_end, cached_at
            FROM search_cache
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read search cache: {}",
                e
            )))
        })?;

        Ok(rows)
    }
}
