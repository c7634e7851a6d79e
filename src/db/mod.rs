//! State database for satfetch
//!
//! SQLite persistence for per-item download state and the search cache.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`items`] — Per-item state rows (the crash-safety backbone)
//! - [`search_cache`] — Cached metadata of the most recent search

use sqlx::sqlite::SqlitePool;

mod items;
mod migrations;
mod search_cache;

pub use items::StatusExtra;

/// State database handle.
///
/// Cheap to clone behind an `Arc`; the pool serializes writes to the
/// underlying file and WAL mode keeps concurrent readers safe.
pub struct Database {
    pool: SqlitePool,
}
