//! Pipeline orchestration: search → download → post-process
//!
//! Jobs run sequentially in configuration order. Each job gets a session
//! (deterministic identity + state store), a stale-state reset when
//! resuming, a working set from the search service or the session's cached
//! scope, and one of three dispatch modes: register-only, remote
//! processing over lazy views, or download with an optional local
//! post-processing consumer.
//!
//! Per-item errors never abort a job; per-job errors never abort the run.
//! Shutdown is cooperative: one cancellation token reaches the downloader
//! and the consumer, the current job drains its in-flight chunks, and the
//! job loop stops.

use crate::catalog::CatalogItem;
use crate::config::{AppConfig, JobConfig, PostProcessMode, format_query_datetime};
use crate::db::{Database, StatusExtra};
use crate::downloader::{DownloadService, decode_entry_key};
use crate::error::{Error, Result};
use crate::filters::FilterRegistry;
use crate::remote::{RemoteDataset, build_remote_dataset};
use crate::retry::RetryConfig;
use crate::search::SearchService;
use crate::session::{Session, SessionLog};
use crate::transport::AuthTransport;
use crate::types::{Event, ItemRecord, ItemStatus, NewCacheEntry};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Error type user hooks may return
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Post-processing hook for downloaded artifacts.
///
/// Called on the blocking pool with the artifact path and the state-row
/// key; a returned error marks exactly that row `failed` and the pipeline
/// continues.
pub trait PostProcessor: Send + Sync {
    /// Process one downloaded artifact
    fn process(&self, path: &Path, item_id: &str) -> std::result::Result<(), HookError>;
}

/// Post-processing hook over a lazy remote view; no bytes are downloaded.
#[async_trait]
pub trait RemoteProcessor: Send + Sync {
    /// Process one item through its remote view
    async fn process(
        &self,
        dataset: &RemoteDataset,
        item_id: &str,
    ) -> std::result::Result<(), HookError>;
}

/// Orchestrates all configured jobs over one authenticated transport.
pub struct Pipeline {
    transport: Arc<AuthTransport>,
    catalog_base: String,
    config: AppConfig,
    post_processor: Option<Arc<dyn PostProcessor>>,
    remote_processor: Option<Arc<dyn RemoteProcessor>>,
    registry: FilterRegistry,
    base_dir: Option<PathBuf>,
    search_retry: RetryConfig,
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<Event>,
}

impl Pipeline {
    /// Build a pipeline for a configuration against a catalog base URL
    pub fn new(transport: Arc<AuthTransport>, catalog_base: impl Into<String>, config: AppConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            transport,
            catalog_base: catalog_base.into(),
            config,
            post_processor: None,
            remote_processor: None,
            registry: FilterRegistry::default(),
            base_dir: None,
            search_retry: RetryConfig::default(),
            shutdown: CancellationToken::new(),
            event_tx,
        }
    }

    /// Attach a local post-processing hook
    pub fn with_post_processor(mut self, hook: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(hook);
        self
    }

    /// Attach a remote post-processing hook
    pub fn with_remote_processor(mut self, hook: Arc<dyn RemoteProcessor>) -> Self {
        self.remote_processor = Some(hook);
        self
    }

    /// Replace the post-search filter registry (after registering
    /// extension filters)
    pub fn with_filter_registry(mut self, registry: FilterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Override the session base directory (default `~/.satfetch`)
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Override the retry policy for catalog calls
    pub fn with_search_retry(mut self, retry: RetryConfig) -> Self {
        self.search_retry = retry;
        self
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The cooperative shutdown token
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request cooperative shutdown: the current job finishes its
    /// in-flight chunks and the job loop stops.
    pub fn request_shutdown(&self) {
        self.emit(Event::ShutdownRequested);
        self.shutdown.cancel();
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Run all jobs in configuration order.
    pub async fn run(&self) -> Result<()> {
        let search = SearchService::new(self.transport.clone(), self.catalog_base.clone())
            .with_retry_config(self.search_retry.clone());

        for job in &self.config.jobs {
            if self.shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, stopping pipeline");
                break;
            }
            if let Err(e) = self.run_job(job, &search).await {
                tracing::error!(job = %job.name, error = %e, "Job failed");
            }
        }

        tracing::info!("Pipeline finished");
        Ok(())
    }

    async fn run_job(&self, job: &JobConfig, search: &SearchService) -> Result<()> {
        let session = match &self.base_dir {
            Some(base) => Session::with_base_dir(job, base)?,
            None => Session::new(job)?,
        };
        session.initialize()?;

        let log = session.log();
        let state = if session.is_new() { "new" } else { "resuming" };
        tracing::info!(
            session = session.session_id(),
            state,
            dir = %session.session_dir().display(),
            "Session ready"
        );
        log.append(&format!(
            "session {} ({state}) for job '{}'",
            session.session_id(),
            job.name
        ));
        if session.is_live() {
            tracing::info!("Live session, search results will be refreshed");
        }

        self.emit(Event::JobStarted {
            job: job.name.clone(),
            session_id: session.session_id().to_string(),
        });

        let db = Arc::new(Database::open(&session.state_db_path()).await?);
        let result = self.run_job_inner(job, search, &session, &db, &log).await;
        db.close().await;

        log.append(&format!("job '{}' finished", job.name));
        self.emit(Event::JobFinished {
            job: job.name.clone(),
        });
        result
    }

    async fn run_job_inner(
        &self,
        job: &JobConfig,
        search: &SearchService,
        session: &Session,
        db: &Arc<Database>,
        log: &SessionLog,
    ) -> Result<()> {
        if !session.is_new() {
            let reset = db.reset_stale(&job.name).await?;
            if reset > 0 {
                tracing::info!(reset, "Reset stale downloading rows to pending");
                log.append(&format!("reset {reset} stale downloading rows"));
            }
        }

        let items = self.resolve_items(job, search, session, db).await?;
        if items.is_empty() {
            tracing::info!(job = %job.name, "Nothing to do");
            return Ok(());
        }

        let remote_mode = job.post_process.enabled
            && job.post_process.mode == PostProcessMode::Remote
            && self.remote_processor.is_some();

        if !job.download.enabled && !remote_mode {
            self.register_pending(&items, job, db).await?;
            tracing::info!(count = items.len(), "Download disabled; items registered only");
            return Ok(());
        }

        if remote_mode {
            return self.run_remote(&items, job, db).await;
        }
        if job.post_process.enabled && job.post_process.mode == PostProcessMode::Remote {
            tracing::warn!(
                job = %job.name,
                "Remote post-processing requested but no remote processor supplied; downloading instead"
            );
        }

        let service = DownloadService::new(db.clone(), session.download_dir(), job.download.clone())
            .with_shutdown_token(self.shutdown.child_token())
            .with_events(self.event_tx.clone());

        if job.post_process.enabled && job.post_process.mode == PostProcessMode::Local {
            match self.post_processor.clone() {
                Some(hook) => {
                    return self
                        .run_with_post_processing(&service, &items, job, db, hook)
                        .await;
                }
                None => {
                    tracing::warn!(
                        job = %job.name,
                        "Post-processing enabled but no post-processor supplied; downloading only"
                    );
                }
            }
        }

        service.download_all(&items, &job.name, &job.collection).await
    }

    /// Resolve the working set: reuse the cached search scope for resumed
    /// non-live sessions, otherwise run the full search (with the optional
    /// post-search filter) and populate the cache.
    async fn resolve_items(
        &self,
        job: &JobConfig,
        search: &SearchService,
        session: &Session,
        db: &Arc<Database>,
    ) -> Result<Vec<Arc<dyn CatalogItem>>> {
        if !session.is_new() && !session.is_live() && db.has_cached_search().await? {
            tracing::info!(job = %job.name, "Using cached search scope");
            let resumable = db.resumable(&job.name).await?;
            if resumable.is_empty() {
                tracing::info!(job = %job.name, "All items already processed");
                return Ok(Vec::new());
            }

            // The state store knows the scope, but fresh catalog handles
            // are still needed to start transfers
            tracing::info!(
                count = resumable.len(),
                "Re-fetching catalog handles for resumable items"
            );
            let resumable_ids: HashSet<String> = resumable
                .iter()
                .map(|r| decode_entry_key(&r.item_id).0.to_string())
                .collect();
            let items: Vec<Arc<dyn CatalogItem>> = search
                .iter_products(&job.collection, &job.filters, job.limit)
                .await?
                .into_iter()
                .filter(|p| resumable_ids.contains(p.id()))
                .map(|p| Arc::new(p) as Arc<dyn CatalogItem>)
                .collect();
            tracing::info!(count = items.len(), "Resumable catalog handles fetched");
            return Ok(items);
        }

        tracing::info!(collection = %job.collection, "Searching for items");
        let mut items: Vec<Arc<dyn CatalogItem>> = search
            .iter_products(&job.collection, &job.filters, job.limit)
            .await?
            .into_iter()
            .map(|p| Arc::new(p) as Arc<dyn CatalogItem>)
            .collect();

        if let Some(filter_config) = &job.post_search_filter {
            let filter = self
                .registry
                .build(&filter_config.kind, &filter_config.params)?;
            let before = items.len();
            items = filter(items);
            tracing::info!(
                before,
                after = items.len(),
                filter = %filter_config.kind,
                "Applied post-search filter"
            );
        }
        tracing::info!(count = items.len(), "Search complete");

        if !items.is_empty() {
            let entries: Vec<NewCacheEntry> = items
                .iter()
                .map(|item| NewCacheEntry {
                    item_id: item.id().to_string(),
                    collection: job.collection.clone(),
                    size_kb: item.size_kb(),
                    sensing_start: item
                        .sensing_start()
                        .map(format_query_datetime)
                        .unwrap_or_default(),
                    sensing_end: item
                        .sensing_end()
                        .map(format_query_datetime)
                        .unwrap_or_default(),
                })
                .collect();
            db.cache_search_results(&entries).await?;
        }

        Ok(items)
    }

    /// Register state rows without transferring anything.
    async fn register_pending(
        &self,
        items: &[Arc<dyn CatalogItem>],
        job: &JobConfig,
        db: &Arc<Database>,
    ) -> Result<()> {
        for item in items {
            if db.get(item.id(), &job.name).await?.is_none() {
                let record = ItemRecord::new(item.id(), job.name.as_str(), job.collection.as_str())
                    .with_size_kb(item.size_kb())
                    .with_md5(item.md5().unwrap_or_default());
                db.upsert(&record).await?;
            }
        }
        Ok(())
    }

    /// Remote mode: hand each non-processed item to the remote hook over a
    /// lazy view; no bytes are transferred.
    async fn run_remote(
        &self,
        items: &[Arc<dyn CatalogItem>],
        job: &JobConfig,
        db: &Arc<Database>,
    ) -> Result<()> {
        let Some(hook) = self.remote_processor.clone() else {
            return Ok(());
        };
        let patterns = job.download.entries.as_deref();

        for item in items {
            if self.shutdown.is_cancelled() {
                break;
            }
            let id = item.id().to_string();

            let existing = db.get(&id, &job.name).await?;
            if let Some(record) = &existing
                && record.status == ItemStatus::Processed
            {
                tracing::info!(item = %id, "Skipping already processed item");
                continue;
            }
            if existing.is_none() {
                let record = ItemRecord::new(id.as_str(), job.name.as_str(), job.collection.as_str())
                    .with_size_kb(item.size_kb())
                    .with_md5(item.md5().unwrap_or_default());
                db.upsert(&record).await?;
            }

            db.update_status(&id, &job.name, ItemStatus::Processing, StatusExtra::default())
                .await?;

            let outcome = match build_remote_dataset(item.as_ref(), self.transport.clone(), patterns).await
            {
                Ok(dataset) => hook.process(&dataset, &id).await,
                Err(e) => Err(Box::new(e) as HookError),
            };

            match outcome {
                Ok(()) => {
                    db.update_status(&id, &job.name, ItemStatus::Processed, StatusExtra::default())
                        .await?;
                    self.emit(Event::ItemCompleted {
                        item: id,
                        path: String::new(),
                    });
                }
                Err(e) => {
                    let message = format!("Remote processing failed: {e}");
                    tracing::error!(item = %id, error = %e, "Remote processing failed");
                    db.update_status(
                        &id,
                        &job.name,
                        ItemStatus::Failed,
                        StatusExtra::error(message.clone()),
                    )
                    .await?;
                    self.emit(Event::ItemFailed {
                        item: id,
                        error: message,
                    });
                }
            }
        }

        Ok(())
    }

    /// Producer/consumer: the downloader produces `verified` rows, the
    /// consumer runs the local hook. A `None` sentinel ends the consumer.
    async fn run_with_post_processing(
        &self,
        service: &DownloadService,
        items: &[Arc<dyn CatalogItem>],
        job: &JobConfig,
        db: &Arc<Database>,
        hook: Arc<dyn PostProcessor>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Option<ItemRecord>>(64);

        let producer = async {
            let result = service.download_all(items, &job.name, &job.collection).await;
            if result.is_ok() {
                match db.by_status(&job.name, ItemStatus::Verified).await {
                    Ok(verified) => {
                        for record in verified {
                            if self.shutdown.is_cancelled() {
                                break;
                            }
                            if tx.send(Some(record)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to list verified rows");
                    }
                }
            }
            let _ = tx.send(None).await;
            result
        };

        let consumer = self.post_process_consumer(db, &job.name, rx, hook);

        let (producer_result, ()) = tokio::join!(producer, consumer);
        producer_result
    }

    async fn post_process_consumer(
        &self,
        db: &Arc<Database>,
        job_name: &str,
        mut rx: mpsc::Receiver<Option<ItemRecord>>,
        hook: Arc<dyn PostProcessor>,
    ) {
        while let Some(message) = rx.recv().await {
            let Some(record) = message else {
                break; // sentinel
            };
            if self.shutdown.is_cancelled() {
                break;
            }

            tracing::info!(item = %record.item_id, "Post-processing item");
            if let Err(e) = db
                .update_status(
                    &record.item_id,
                    job_name,
                    ItemStatus::Processing,
                    StatusExtra::default(),
                )
                .await
            {
                tracing::error!(item = %record.item_id, error = %e, "Failed to record processing status");
                continue;
            }

            let path = PathBuf::from(&record.download_path);
            let item_id = record.item_id.clone();
            let hook = hook.clone();
            let outcome = tokio::task::spawn_blocking(move || hook.process(&path, &item_id))
                .await
                .unwrap_or_else(|e| Err(Box::new(Error::Other(format!("post-process task failed: {e}"))) as HookError));

            match outcome {
                Ok(()) => {
                    let _ = db
                        .update_status(
                            &record.item_id,
                            job_name,
                            ItemStatus::Processed,
                            StatusExtra::default(),
                        )
                        .await;
                    self.emit(Event::ItemCompleted {
                        item: record.item_id.clone(),
                        path: record.download_path.clone(),
                    });
                }
                Err(e) => {
                    let message = format!("Post-processing failed: {e}");
                    tracing::error!(item = %record.item_id, error = %e, "Post-processing failed");
                    let _ = db
                        .update_status(
                            &record.item_id,
                            job_name,
                            ItemStatus::Failed,
                            StatusExtra::error(message.clone()),
                        )
                        .await;
                    self.emit(Event::ItemFailed {
                        item: record.item_id.clone(),
                        error: message,
                    });
                }
            }
        }
    }
}
