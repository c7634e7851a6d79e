//! # satfetch
//!
//! Resumable bulk downloader library for satellite-data catalogs.
//!
//! Given a declarative job (collection, search filters, transfer options),
//! satfetch discovers matching products through the catalog search API,
//! tracks per-item progress in a SQLite state store, transfers payloads
//! concurrently over authenticated HTTP with byte-range resume and MD5
//! verification, optionally hands completed items to a post-processing
//! hook, and survives interruption: a later invocation finishes exactly
//! the remaining work.
//!
//! ## Design Philosophy
//!
//! - **Crash-safe by construction** - every observable transition lands in
//!   the state store before the next step runs
//! - **Library-first** - no CLI or UI; consumers embed the pipeline and
//!   subscribe to events
//! - **Explicit credentials** - a `TokenProvider` value is injected
//!   everywhere; no hidden globals
//!
//! ## Quick Start
//!
//! ```no_run
//! use satfetch::{AuthTransport, Pipeline, StaticTokenProvider, load_config, run_with_shutdown};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config("jobs.yaml")?;
//!     let transport =
//!         AuthTransport::new(Arc::new(StaticTokenProvider::new("my-token"))).await?;
//!     let pipeline = Pipeline::new(
//!         Arc::new(transport),
//!         "https://catalog.example.org/api/v1",
//!         config,
//!     );
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Run with automatic signal handling
//!     run_with_shutdown(pipeline).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Catalog item contract and HTTP adapter
pub mod catalog;
/// Configuration types and YAML loading
pub mod config;
/// Credential discovery and token provider contract
pub mod credentials;
/// State database (per-item rows, search cache)
pub mod db;
/// Concurrent download engine
pub mod downloader;
/// Error types
pub mod error;
/// Post-search filter registry
pub mod filters;
/// Pipeline orchestration
pub mod pipeline;
/// Lazy remote views over authenticated HTTP
pub mod remote;
/// Retry logic with exponential backoff
pub mod retry;
/// Catalog search service with range bisection
pub mod search;
/// Session identity and on-disk layout
pub mod session;
/// Token-refreshing authenticated transport
pub mod transport;
/// Utility functions
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use catalog::{CatalogItem, ItemMeta, ProductHandle};
pub use config::{
    AppConfig, DownloadOptions, JobConfig, LoggingConfig, PostProcessMode, PostProcessOptions,
    PostSearchFilterConfig, SearchFilters, load_config,
};
pub use credentials::{Credentials, StaticTokenProvider, TokenProvider};
pub use db::{Database, StatusExtra};
pub use downloader::DownloadService;
pub use error::{DatabaseError, Error, Result};
pub use filters::FilterRegistry;
pub use pipeline::{Pipeline, PostProcessor, RemoteProcessor};
pub use remote::{RemoteDataset, RemoteEntry, RemoteFile, build_remote_dataset};
pub use search::{CollectionInfo, CollectionSummary, SearchResult, SearchService};
pub use session::Session;
pub use transport::AuthTransport;
pub use types::{Event, ItemRecord, ItemStatus};

/// Core types (status enum, state rows, events)
pub mod types;

/// Run the pipeline with graceful signal handling.
///
/// Requests cooperative shutdown when a termination signal arrives:
/// SIGTERM/SIGINT on unix (with fallbacks if registration fails), Ctrl+C
/// elsewhere. The current job finishes its in-flight chunks before the
/// run returns.
pub async fn run_with_shutdown(pipeline: Pipeline) -> Result<()> {
    let token = pipeline.shutdown_token();
    let signal_task = tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });

    let result = pipeline.run().await;
    signal_task.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers,
    // tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
