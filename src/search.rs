//! Catalog search service
//!
//! Collection lookup, total-count queries, and product enumeration against
//! the catalog's JSON search API. A single query is capped at ten thousand
//! results upstream; [`SearchService::iter_products`] walks past the cap by
//! recursively bisecting the time window until every leaf query fits.
//!
//! Every upstream call runs inside the shared retry helper (transient
//! classification, exponential backoff; default three retries, two-second
//! base).

use crate::catalog::{ItemMeta, ProductHandle};
use crate::config::SearchFilters;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::transport::AuthTransport;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Upstream cap on results returned by a single search query
pub const MAX_RESULTS_PER_QUERY: u64 = 10_000;

/// Collection id and title, as returned by the listing endpoint
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Collection identifier
    pub id: String,
    /// Human-readable title
    pub title: String,
}

/// Detailed collection information
#[derive(Clone, Debug, Deserialize)]
pub struct CollectionInfo {
    /// Collection identifier
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// Abstract text
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    /// Search filters the catalog discloses for this collection; may be
    /// empty when the catalog does not publish them
    #[serde(default)]
    pub search_options: BTreeMap<String, serde_json::Value>,
}

/// Result of a product search
pub struct SearchResult {
    /// Total matching products upstream (may exceed `items.len()`)
    pub total: u64,
    /// Product handles, at most `limit` when one was given
    pub items: Vec<ProductHandle>,
    /// The query parameters that were sent
    pub filters_used: Vec<(&'static str, String)>,
}

#[derive(Deserialize)]
struct CollectionsResponse {
    collections: Vec<CollectionSummary>,
}

#[derive(Deserialize)]
struct SearchResponse {
    total: u64,
    #[serde(default)]
    items: Vec<ItemMeta>,
}

/// Catalog search client over the authenticated transport
pub struct SearchService {
    transport: Arc<AuthTransport>,
    base_url: String,
    retry: RetryConfig,
}

impl SearchService {
    /// Build a search service for a catalog base URL
    pub fn new(transport: Arc<AuthTransport>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            transport,
            base_url,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy for upstream calls
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// List all available collections
    pub async fn list_collections(&self) -> Result<Vec<CollectionSummary>> {
        let url = format!("{}/collections", self.base_url);
        let body: CollectionsResponse = self.fetch_json(&url).await?;
        Ok(body.collections)
    }

    /// Detailed information about one collection
    pub async fn collection_info(&self, collection_id: &str) -> Result<CollectionInfo> {
        let url = format!(
            "{}/collections/{}",
            self.base_url,
            urlencoding::encode(collection_id)
        );
        self.fetch_json(&url).await
    }

    /// Total result count without fetching products (a `limit=0` query)
    pub async fn count(&self, collection_id: &str, filters: &SearchFilters) -> Result<u64> {
        let url = self.search_url(collection_id, filters, Some(0))?;
        let body: SearchResponse = self.fetch_json(&url).await?;
        Ok(body.total)
    }

    /// Search for products matching the filters
    pub async fn search(
        &self,
        collection_id: &str,
        filters: &SearchFilters,
        limit: Option<usize>,
    ) -> Result<SearchResult> {
        let url = self.search_url(collection_id, filters, limit)?;
        let body: SearchResponse = self.fetch_json(&url).await?;

        let mut items: Vec<ProductHandle> = body
            .items
            .into_iter()
            .map(|meta| ProductHandle::new(meta, self.transport.clone()))
            .collect();
        if let Some(limit) = limit {
            items.truncate(limit);
        }

        tracing::info!(
            returned = items.len(),
            total = body.total,
            collection = collection_id,
            "Search complete"
        );

        Ok(SearchResult {
            total: body.total,
            items,
            filters_used: filters.to_query_params(),
        })
    }

    /// Enumerate matching products, bisecting the time window when the
    /// total exceeds the per-query cap.
    pub async fn iter_products(
        &self,
        collection_id: &str,
        filters: &SearchFilters,
        limit: Option<usize>,
    ) -> Result<Vec<ProductHandle>> {
        let total = self.count(collection_id, filters).await?;

        if total <= MAX_RESULTS_PER_QUERY {
            return Ok(self.search(collection_id, filters, limit).await?.items);
        }

        tracing::info!(
            total,
            cap = MAX_RESULTS_PER_QUERY,
            "Result count exceeds the per-query cap, bisecting time range"
        );
        let mut products = self.bisect_search(collection_id, filters.clone()).await?;
        if let Some(limit) = limit {
            products.truncate(limit);
        }
        Ok(products)
    }

    /// Recursively bisect the time range until every leaf query fits under
    /// the cap; leaves are concatenated in range order.
    fn bisect_search<'a>(
        &'a self,
        collection_id: &'a str,
        filters: SearchFilters,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ProductHandle>>> + Send + 'a>> {
        Box::pin(async move {
            let (Some(start), Some(end)) = (filters.dtstart, filters.dtend) else {
                return Err(Error::InvalidInput(
                    "time range (dtstart, dtend) is required to page past the per-query cap"
                        .to_string(),
                ));
            };

            // Degenerate window: nothing left to split
            if end <= start {
                return Ok(self.search(collection_id, &filters, None).await?.items);
            }

            let midpoint = start + (end - start) / 2;

            let mut first = filters.clone();
            first.dtend = Some(midpoint);
            let mut second = filters;
            second.dtstart = Some(midpoint);

            let mut products = Vec::new();
            for half in [first, second] {
                let count = self.count(collection_id, &half).await?;
                if count <= MAX_RESULTS_PER_QUERY {
                    products.extend(self.search(collection_id, &half, None).await?.items);
                } else {
                    products.extend(self.bisect_search(collection_id, half).await?);
                }
            }
            Ok(products)
        })
    }

    fn search_url(
        &self,
        collection_id: &str,
        filters: &SearchFilters,
        limit: Option<usize>,
    ) -> Result<String> {
        let raw = format!(
            "{}/collections/{}/search",
            self.base_url,
            urlencoding::encode(collection_id)
        );
        let mut url = url::Url::parse(&raw)
            .map_err(|e| Error::Catalog(format!("invalid search URL '{raw}': {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in filters.to_query_params() {
                pairs.append_pair(key, &value);
            }
            if let Some(limit) = limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url.into())
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let url_ref = &url;
        retry_with_backoff(&self.retry, || async move {
            let resp = self.transport.get(url_ref).await?;
            resp.json::<T>()
                .await
                .map_err(|e| Error::Catalog(format!("invalid catalog response: {e}")))
        })
        .await
    }
}
