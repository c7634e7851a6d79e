//! Concurrent download engine
//!
//! Transfers every item of a work list to disk with bounded parallelism,
//! recording each observable transition in the state store so an
//! interrupted run can be finished by a later one.
//!
//! - [`transfer`] — per-item lifecycle: retry loop, byte-range resume,
//!   streaming, integrity verification
//!
//! Two registration modes: whole-product (one state row per item) and
//! sub-entry (glob patterns select entries; one row per match, keyed with
//! an encoded `::entry::` suffix). Already-terminal rows are never
//! redownloaded.

mod transfer;

use crate::catalog::CatalogItem;
use crate::config::DownloadOptions;
use crate::db::Database;
use crate::error::Result;
use crate::remote::compile_patterns;
use crate::types::{Event, ItemRecord};
use crate::utils::available_disk_space;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// Streaming chunk pacing for hashing and file reads
pub(crate) const CHUNK_SIZE: usize = 8192;

/// Separator encoding an entry name into a state-row key. Catalog ids
/// never contain this sequence.
pub(crate) const ENTRY_SEP: &str = "::entry::";

/// Encode a `(item id, entry name)` pair as a single state-row key
pub(crate) fn encode_entry_key(item_id: &str, entry_name: &str) -> String {
    format!("{item_id}{ENTRY_SEP}{entry_name}")
}

/// Split a state-row key into `(item id, entry name)`; the entry is `None`
/// for whole-product keys.
pub(crate) fn decode_entry_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(ENTRY_SEP) {
        Some((item_id, entry)) => (item_id, Some(entry)),
        None => (key, None),
    }
}

/// Bounded-parallelism transfer engine with resume, retry, verification,
/// and cooperative shutdown.
pub struct DownloadService {
    db: Arc<Database>,
    download_dir: PathBuf,
    options: DownloadOptions,
    shutdown: CancellationToken,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl DownloadService {
    /// Build a download service writing into `download_dir`
    pub fn new(db: Arc<Database>, download_dir: impl Into<PathBuf>, options: DownloadOptions) -> Self {
        Self {
            db,
            download_dir: download_dir.into(),
            options,
            shutdown: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Use an externally owned shutdown token (the orchestrator's)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Attach an event broadcast sender
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Token observed before dequeuing, between retries, and between chunks
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal graceful shutdown. In-flight chunks finish; partial files
    /// stay on disk and rows keep their current status for the next run's
    /// stale reset.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).ok();
        }
    }

    /// Transfer every resumable item of the job, with at most
    /// `options.parallel` transfers in flight.
    pub async fn download_all(
        &self,
        items: &[Arc<dyn CatalogItem>],
        job_name: &str,
        collection: &str,
    ) -> Result<()> {
        self.register_items(items, job_name, collection).await?;

        let rows = self.db.resumable(job_name).await?;
        if rows.is_empty() {
            tracing::info!(job = job_name, "No items to download");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        self.check_disk_space(&rows);

        let item_map: HashMap<&str, &Arc<dyn CatalogItem>> =
            items.iter().map(|item| (item.id(), item)).collect();

        let semaphore = Arc::new(Semaphore::new(self.options.parallel.max(1)));
        let mut transfers = Vec::new();
        for record in rows {
            let key = record.item_id.clone();
            let (base_id, entry) = decode_entry_key(&key);
            let Some(item) = item_map.get(base_id) else {
                tracing::warn!(
                    item = base_id,
                    "Item not present in search results, skipping"
                );
                continue;
            };
            transfers.push(self.download_one(
                semaphore.clone(),
                Arc::clone(item),
                entry.map(str::to_string),
                record,
            ));
        }

        futures::future::join_all(transfers).await;
        Ok(())
    }

    /// Register state rows for the work list.
    ///
    /// Whole-product mode writes one row per item with its published size
    /// and digest. Sub-entry mode matches the glob patterns against each
    /// entry name and its basename, one row per match; items whose entry
    /// enumeration fails are warned and skipped.
    async fn register_items(
        &self,
        items: &[Arc<dyn CatalogItem>],
        job_name: &str,
        collection: &str,
    ) -> Result<()> {
        let patterns = match &self.options.entries {
            Some(patterns) => Some(compile_patterns(patterns)?),
            None => None,
        };

        for item in items {
            let item_id = item.id().to_string();

            if let Some(patterns) = &patterns {
                let all_entries = match item.entries().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::warn!(
                            item = %item_id,
                            error = %e,
                            "Could not list entries, skipping item"
                        );
                        continue;
                    }
                };
                let matching: Vec<String> = all_entries
                    .into_iter()
                    .filter(|entry| {
                        let basename = entry.rsplit('/').next().unwrap_or(entry);
                        patterns.iter().any(|p| p.matches(basename) || p.matches(entry))
                    })
                    .collect();
                if matching.is_empty() {
                    tracing::warn!(
                        item = %item_id,
                        patterns = ?self.options.entries,
                        "No entries matched patterns, skipping item"
                    );
                    continue;
                }
                for entry_name in matching {
                    let key = encode_entry_key(&item_id, &entry_name);
                    match self.db.get(&key, job_name).await? {
                        Some(existing) if existing.status.is_terminal_success() => {
                            tracing::info!(key = %key, "Skipping already verified/processed entry");
                        }
                        Some(_) => {}
                        None => {
                            // Per-entry sizes are not published in item metadata
                            self.db
                                .upsert(&ItemRecord::new(key, job_name, collection))
                                .await?;
                        }
                    }
                }
            } else {
                match self.db.get(&item_id, job_name).await? {
                    Some(existing) if existing.status.is_terminal_success() => {
                        tracing::info!(item = %item_id, "Skipping already verified/processed item");
                    }
                    Some(_) => {}
                    None => {
                        let record = ItemRecord::new(item_id, job_name, collection)
                            .with_size_kb(item.size_kb())
                            .with_md5(item.md5().unwrap_or_default());
                        self.db.upsert(&record).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Best-effort free-space check; warns, never fails.
    fn check_disk_space(&self, rows: &[ItemRecord]) {
        let estimated_bytes: f64 = rows.iter().map(|r| r.size_kb * 1000.0).sum();
        if estimated_bytes <= 0.0 {
            return;
        }
        match available_disk_space(&self.download_dir) {
            Ok(free) if (free as f64) < estimated_bytes => {
                tracing::warn!(
                    needed_gb = estimated_bytes / 1e9,
                    free_gb = free as f64 / 1e9,
                    "Low disk space for estimated download size"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not check free disk space");
            }
        }
    }
}
