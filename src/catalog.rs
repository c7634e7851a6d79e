//! Catalog item contract and the HTTP-backed adapter
//!
//! The pipeline only ever touches catalog products through the narrow
//! [`CatalogItem`] trait: identity, size, digest, base URL, sensing
//! timestamps, entry enumeration, and an open-as-stream operation. The
//! concrete [`ProductHandle`] adapter wires search-result metadata to the
//! shared authenticated transport.

use crate::error::{Error, Result};
use crate::transport::AuthTransport;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

/// Stream of payload chunks from an open catalog object
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Narrow contract the core needs from a catalog product.
///
/// Missing metadata maps to defaults (`0` size, no digest, no timestamps);
/// the pipeline treats those as "unknown", never as errors.
#[async_trait]
pub trait CatalogItem: Send + Sync {
    /// Catalog identifier of the item
    fn id(&self) -> &str;

    /// Published size in kilobytes (0 if unknown)
    fn size_kb(&self) -> f64 {
        0.0
    }

    /// Published content digest (whole-product MD5)
    fn md5(&self) -> Option<&str> {
        None
    }

    /// Base URL of the item's payload
    fn url(&self) -> &str;

    /// Sensing window start
    fn sensing_start(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Sensing window end
    fn sensing_end(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Names of the item's sub-entries
    async fn entries(&self) -> Result<Vec<String>>;

    /// Open the whole product (or one entry) as a byte stream, optionally
    /// restricted to a byte range (`start`, optional inclusive `end`).
    async fn open(
        &self,
        entry: Option<&str>,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<ByteStream>;
}

/// Item metadata as returned by the catalog search endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemMeta {
    /// Catalog identifier
    pub id: String,
    /// Size in kilobytes
    #[serde(default)]
    pub size: f64,
    /// Whole-product MD5 digest
    #[serde(default)]
    pub md5: Option<String>,
    /// Payload base URL
    pub url: String,
    /// Sensing window start
    #[serde(default)]
    pub sensing_start: Option<DateTime<Utc>>,
    /// Sensing window end
    #[serde(default)]
    pub sensing_end: Option<DateTime<Utc>>,
}

/// Concrete catalog item backed by the authenticated transport
#[derive(Clone)]
pub struct ProductHandle {
    meta: ItemMeta,
    transport: Arc<AuthTransport>,
}

impl ProductHandle {
    /// Build a handle from search metadata and the shared transport
    pub fn new(meta: ItemMeta, transport: Arc<AuthTransport>) -> Self {
        Self { meta, transport }
    }

    /// The raw search metadata
    pub fn meta(&self) -> &ItemMeta {
        &self.meta
    }

    /// URL of a named entry inside this item
    pub fn entry_url(&self, entry: &str) -> String {
        format!("{}/entry?name={}", self.meta.url, urlencoding::encode(entry))
    }
}

impl std::fmt::Debug for ProductHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductHandle")
            .field("id", &self.meta.id)
            .field("url", &self.meta.url)
            .finish()
    }
}

#[async_trait]
impl CatalogItem for ProductHandle {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn size_kb(&self) -> f64 {
        self.meta.size
    }

    fn md5(&self) -> Option<&str> {
        self.meta.md5.as_deref()
    }

    fn url(&self) -> &str {
        &self.meta.url
    }

    fn sensing_start(&self) -> Option<DateTime<Utc>> {
        self.meta.sensing_start
    }

    fn sensing_end(&self) -> Option<DateTime<Utc>> {
        self.meta.sensing_end
    }

    async fn entries(&self) -> Result<Vec<String>> {
        self.transport
            .list(&format!("{}/entries", self.meta.url))
            .await
    }

    async fn open(
        &self,
        entry: Option<&str>,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<ByteStream> {
        let url = match entry {
            Some(name) => self.entry_url(name),
            None => self.meta.url.clone(),
        };

        let resp = match range {
            Some((start, end)) => self.transport.get_range(&url, start, end).await?,
            None => self.transport.get(&url).await?,
        };

        Ok(Box::pin(resp.bytes_stream().map_err(Error::from)))
    }
}
