//! Per-item transfer lifecycle: retry loop, resume, streaming, verification.

use super::{CHUNK_SIZE, DownloadService};
use crate::catalog::{ByteStream, CatalogItem};
use crate::db::StatusExtra;
use crate::error::{Error, Result};
use crate::retry::IsRetryable;
use crate::types::{Event, ItemRecord, ItemStatus};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

impl DownloadService {
    /// Download a single item (or entry) under the concurrency gate.
    ///
    /// Errors never propagate out of here; every outcome lands in the
    /// state store so siblings keep running.
    pub(super) async fn download_one(
        &self,
        semaphore: Arc<Semaphore>,
        item: Arc<dyn CatalogItem>,
        entry: Option<String>,
        record: ItemRecord,
    ) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };

        let db_key = record.item_id.clone();
        let job_name = record.job_name.clone();
        // Entry downloads land under the entry's basename; whole products
        // under the item id
        let filename = match entry.as_deref() {
            Some(name) => name.rsplit('/').next().unwrap_or(name).to_string(),
            None => db_key.clone(),
        };
        let path = self.download_dir.join(&filename);
        // Rows re-entering from failed restart from byte zero; a suspect
        // file (e.g. a digest mismatch) is never extended
        let allow_resume = self.options.resume && record.status != ItemStatus::Failed;

        self.emit(Event::ItemStarted { item: db_key.clone() });

        let mut last_error: Option<Error> = None;
        for attempt in 0..=self.options.max_retries {
            if self.shutdown.is_cancelled() {
                return;
            }

            if let Err(e) = self
                .db
                .update_status(&db_key, &job_name, ItemStatus::Downloading, StatusExtra::default())
                .await
            {
                tracing::error!(item = %db_key, error = %e, "Failed to record downloading status");
                return;
            }

            match self
                .attempt_transfer(item.as_ref(), entry.as_deref(), &path, allow_resume, &db_key)
                .await
            {
                Ok(Some(_written)) => {
                    self.finalize(item.as_ref(), entry.as_deref(), &db_key, &job_name, &path)
                        .await;
                    last_error = None;
                    break;
                }
                Ok(None) => {
                    // Shutdown mid-stream: partial file stays, row keeps its
                    // status for the next run's stale reset
                    return;
                }
                Err(e) if e.is_retryable() => {
                    if attempt < self.options.max_retries {
                        let wait = Duration::from_secs_f64(
                            self.options.retry_backoff * 2f64.powi(attempt as i32),
                        );
                        tracing::warn!(
                            item = %db_key,
                            attempt = attempt + 1,
                            attempts_total = self.options.max_retries + 1,
                            error = %e,
                            wait_secs = wait.as_secs_f64(),
                            "Retryable transfer error, backing off"
                        );
                        // Progress resets for the retry
                        self.emit(Event::ItemProgress {
                            item: db_key.clone(),
                            bytes: 0,
                        });
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.shutdown.cancelled() => return,
                        }
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::error!(item = %db_key, error = %e, "Non-retryable transfer error");
                    let _ = self
                        .db
                        .update_status(
                            &db_key,
                            &job_name,
                            ItemStatus::Failed,
                            StatusExtra::error(e.to_string()),
                        )
                        .await;
                    self.emit(Event::ItemFailed {
                        item: db_key.clone(),
                        error: e.to_string(),
                    });
                    last_error = None;
                    break;
                }
            }
        }

        if let Some(e) = last_error {
            let attempts = self.options.max_retries + 1;
            let message = format!("Failed after {attempts} attempts: {e}");
            tracing::error!(item = %db_key, attempts, error = %e, "Transfer failed");
            let _ = self
                .db
                .update_status(
                    &db_key,
                    &job_name,
                    ItemStatus::Failed,
                    StatusExtra::error(message.clone()),
                )
                .await;
            self.emit(Event::ItemFailed {
                item: db_key,
                error: message,
            });
        }
    }

    /// One transfer attempt under the per-item deadline.
    ///
    /// `Ok(None)` means shutdown was observed mid-stream.
    async fn attempt_transfer(
        &self,
        item: &dyn CatalogItem,
        entry: Option<&str>,
        path: &Path,
        allow_resume: bool,
        key: &str,
    ) -> Result<Option<u64>> {
        let deadline = self.options.timeout_duration();
        match tokio::time::timeout(deadline, self.transfer(item, entry, path, allow_resume, key))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    async fn transfer(
        &self,
        item: &dyn CatalogItem,
        entry: Option<&str>,
        path: &Path,
        allow_resume: bool,
        key: &str,
    ) -> Result<Option<u64>> {
        let mut offset = 0u64;
        if allow_resume {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                offset = meta.len();
            }
        }

        if offset > 0 {
            tracing::info!(item = key, offset, "Resuming via byte-range request");
            match self.range_transfer(item, entry, path, offset, key).await {
                Ok(done) => return Ok(done),
                Err(e) => {
                    tracing::info!(
                        item = key,
                        error = %e,
                        "Byte-range resume not supported, restarting from zero"
                    );
                    self.emit(Event::ItemProgress {
                        item: key.to_string(),
                        bytes: 0,
                    });
                }
            }
        }

        let stream = item.open(entry, None).await?;
        let mut file = tokio::fs::File::create(path).await?;
        self.stream_to_file(stream, &mut file, 0, key).await
    }

    /// Append the byte range `[offset, end]` to the partial file. Any
    /// failure makes the caller fall back to a full transfer.
    async fn range_transfer(
        &self,
        item: &dyn CatalogItem,
        entry: Option<&str>,
        path: &Path,
        offset: u64,
        key: &str,
    ) -> Result<Option<u64>> {
        let stream = item.open(entry, Some((offset, None))).await?;
        let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
        self.stream_to_file(stream, &mut file, offset, key).await
    }

    /// Stream chunks into the file, checking the shutdown flag between
    /// chunks. `Ok(None)` = aborted on shutdown.
    async fn stream_to_file(
        &self,
        mut stream: ByteStream,
        file: &mut tokio::fs::File,
        start: u64,
        key: &str,
    ) -> Result<Option<u64>> {
        let mut written = start;
        loop {
            if self.shutdown.is_cancelled() {
                file.flush().await?;
                return Ok(None);
            }
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    self.emit(Event::ItemProgress {
                        item: key.to_string(),
                        bytes: written,
                    });
                }
                None => break,
            }
        }
        file.flush().await?;
        Ok(Some(written))
    }

    /// Record `downloaded`, then verify (whole-product mode only) and move
    /// the row to its terminal status.
    async fn finalize(
        &self,
        item: &dyn CatalogItem,
        entry: Option<&str>,
        db_key: &str,
        job_name: &str,
        path: &Path,
    ) {
        let observed = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::error!(item = db_key, error = %e, "Downloaded file missing");
                let _ = self
                    .db
                    .update_status(
                        db_key,
                        job_name,
                        ItemStatus::Failed,
                        StatusExtra::error(format!("downloaded file missing: {e}")),
                    )
                    .await;
                return;
            }
        };

        if let Err(e) = self
            .db
            .update_status(
                db_key,
                job_name,
                ItemStatus::Downloaded,
                StatusExtra {
                    download_path: Some(path.display().to_string()),
                    bytes_downloaded: Some(observed as i64),
                    error_message: None,
                },
            )
            .await
        {
            tracing::error!(item = db_key, error = %e, "Failed to record downloaded status");
            return;
        }

        // The published digest covers the whole product; entry downloads
        // cannot be verified against it
        let verdict = if self.options.verify_md5 && entry.is_none() {
            verify_md5(item.md5().map(str::to_string), path.to_path_buf()).await
        } else {
            Ok(true)
        };

        match verdict {
            Ok(true) => {
                let _ = self
                    .db
                    .update_status(db_key, job_name, ItemStatus::Verified, StatusExtra::default())
                    .await;
                self.emit(Event::ItemCompleted {
                    item: db_key.to_string(),
                    path: path.display().to_string(),
                });
            }
            Ok(false) => {
                let _ = self
                    .db
                    .update_status(
                        db_key,
                        job_name,
                        ItemStatus::Failed,
                        StatusExtra::error("MD5 verification failed"),
                    )
                    .await;
                self.emit(Event::ItemFailed {
                    item: db_key.to_string(),
                    error: "MD5 verification failed".to_string(),
                });
            }
            Err(e) => {
                let _ = self
                    .db
                    .update_status(
                        db_key,
                        job_name,
                        ItemStatus::Failed,
                        StatusExtra::error(format!("verification error: {e}")),
                    )
                    .await;
                self.emit(Event::ItemFailed {
                    item: db_key.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Hash the file on the blocking pool and compare against the published
/// digest. A missing digest skips verification (treated as success); a
/// mismatch is a pure verification failure and never triggers a retry.
async fn verify_md5(expected: Option<String>, path: std::path::PathBuf) -> Result<bool> {
    let Some(expected) = expected.filter(|digest| !digest.is_empty()) else {
        tracing::warn!(path = %path.display(), "No MD5 digest published, skipping verification");
        return Ok(true);
    };

    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut context = md5::Context::new();
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
        }
        let computed = format!("{:x}", context.compute());
        if computed != expected {
            tracing::error!(
                path = %path.display(),
                expected,
                computed,
                "MD5 mismatch"
            );
            return Ok(false);
        }
        tracing::info!(path = %path.display(), "MD5 verified");
        Ok(true)
    })
    .await
    .map_err(|e| Error::Other(format!("verification task failed: {e}")))?
}
