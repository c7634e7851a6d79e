//! Token-refreshing authenticated HTTP transport
//!
//! A read-only GET surface that attaches `Authorization: Bearer <t>` to
//! every request, where `t` comes from an injected [`TokenProvider`]. On an
//! unauthorized response the transport refreshes the token once and retries
//! once; non-401 responses and non-HTTP errors propagate unchanged.
//!
//! Refresh protocol under concurrency: a single refresh mutex serializes
//! refreshers. The first caller through re-reads the token, swaps the
//! stored header, and rebuilds the `reqwest::Client` (dropping the old
//! connection pool rather than mutating header state the HTTP library may
//! treat as read-only). Callers queued behind the lock see the header
//! already updated and return without a second rebuild.
//!
//! URL discipline: pre-percent-encoded URLs pass through without
//! re-encoding; `%3A` stays `%3A` on the wire.

use crate::credentials::TokenProvider;
use crate::error::{Error, Result};
use reqwest::header::{AUTHORIZATION, RANGE};
use reqwest::{Client, Method, Response, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct ClientState {
    client: Client,
    auth_header: String,
}

/// Authenticated HTTP transport shared by the downloader, the search
/// service, and lazy remote views.
pub struct AuthTransport {
    provider: Arc<dyn TokenProvider>,
    state: tokio::sync::RwLock<ClientState>,
    refresh_lock: tokio::sync::Mutex<()>,
    pool_generation: AtomicU64,
}

impl AuthTransport {
    /// Build a transport, acquiring an initial token from the provider.
    pub async fn new(provider: Arc<dyn TokenProvider>) -> Result<Self> {
        let token = read_token(provider.clone()).await?;
        Ok(Self {
            provider,
            state: tokio::sync::RwLock::new(ClientState {
                client: build_client()?,
                auth_header: format!("Bearer {token}"),
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            pool_generation: AtomicU64::new(0),
        })
    }

    /// GET a URL, returning the streaming response.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let resp = self.request(Method::GET, url, None).await?;
        Ok(resp.error_for_status()?)
    }

    /// GET a byte range of a URL (`end` inclusive when given, open-ended
    /// otherwise).
    pub async fn get_range(&self, url: &str, start: u64, end: Option<u64>) -> Result<Response> {
        let resp = self.request(Method::GET, url, Some((start, end))).await?;
        Ok(resp.error_for_status()?)
    }

    /// Read a byte range fully into memory.
    pub async fn read_range(&self, url: &str, start: u64, end: Option<u64>) -> Result<bytes::Bytes> {
        let resp = self.get_range(url, start, end).await?;
        Ok(resp.bytes().await?)
    }

    /// List the entry names beneath a remote object.
    ///
    /// Expects a JSON body of the form `{"entries": ["name", ...]}`.
    pub async fn list(&self, url: &str) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Listing {
            entries: Vec<String>,
        }

        let resp = self.get(url).await?;
        let listing: Listing = resp
            .json()
            .await
            .map_err(|e| Error::Catalog(format!("invalid listing response: {e}")))?;
        Ok(listing.entries)
    }

    /// Content length of the remote object, when the server reports one.
    pub async fn content_length(&self, url: &str) -> Result<Option<u64>> {
        let resp = self.request(Method::HEAD, url, None).await?;
        let resp = resp.error_for_status()?;
        Ok(resp.content_length())
    }

    /// Whether the remote object exists (404 → false).
    pub async fn exists(&self, url: &str) -> Result<bool> {
        let resp = self.request(Method::HEAD, url, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }

    /// Refresh the bearer token and invalidate the connection pool.
    ///
    /// Idempotent under concurrent callers: only the first through the lock
    /// does real work.
    pub async fn refresh_auth(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let token = read_token(self.provider.clone()).await?;
        let new_auth = format!("Bearer {token}");

        // Every caller queued behind the lock reaches this check; once the
        // first one refreshed, the rest skip.
        {
            let state = self.state.read().await;
            if state.auth_header == new_auth {
                return Ok(());
            }
        }

        let mut state = self.state.write().await;
        state.auth_header = new_auth;
        state.client = build_client()?;
        self.pool_generation.fetch_add(1, Ordering::SeqCst);

        tracing::debug!("Bearer token refreshed; connection pool rebuilt");
        Ok(())
    }

    /// The `Authorization` header value currently attached to requests.
    pub async fn auth_header(&self) -> String {
        self.state.read().await.auth_header.clone()
    }

    /// How many times the connection pool has been rebuilt by refreshes.
    pub fn pool_generation(&self) -> u64 {
        self.pool_generation.load(Ordering::SeqCst)
    }

    /// Issue a request with the retry-once-on-401 policy. The returned
    /// response may still carry a non-401 error status.
    async fn request(
        &self,
        method: Method,
        url: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<Response> {
        let resp = self.request_once(method.clone(), url, range).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        tracing::info!(url, "HTTP 401 received; refreshing bearer token and retrying");
        self.refresh_auth().await?;
        self.request_once(method, url, range).await
    }

    async fn request_once(
        &self,
        method: Method,
        url: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<Response> {
        let (client, auth) = {
            let state = self.state.read().await;
            (state.client.clone(), state.auth_header.clone())
        };

        let mut request = client.request(method, url).header(AUTHORIZATION, auth);
        if let Some((start, end)) = range {
            let value = match end {
                Some(end) => format!("bytes={start}-{end}"),
                None => format!("bytes={start}-"),
            };
            request = request.header(RANGE, value);
        }

        Ok(request.send().await?)
    }
}

fn build_client() -> Result<Client> {
    Ok(Client::builder().build()?)
}

/// Bridge the possibly-blocking token accessor off the I/O threads.
async fn read_token(provider: Arc<dyn TokenProvider>) -> Result<String> {
    tokio::task::spawn_blocking(move || provider.current_token())
        .await
        .map_err(|e| Error::Other(format!("token acquisition task failed: {e}")))?
}
