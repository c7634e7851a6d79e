//! Shared test fixtures: a scriptable in-memory catalog item.

use crate::catalog::{ByteStream, CatalogItem};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// How a [`MockItem`] should fail its first open attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailMode {
    /// Connection-reset style transient error
    Transient,
    /// Non-retryable error
    Permanent,
}

/// Scriptable catalog item serving an in-memory payload.
pub(crate) struct MockItem {
    pub id: String,
    pub size_kb: f64,
    pub md5: Option<String>,
    pub url: String,
    pub sensing_start: Option<DateTime<Utc>>,
    pub sensing_end: Option<DateTime<Utc>>,
    /// `None` makes `entries()` fail
    pub entry_names: Option<Vec<String>>,
    pub body: Vec<u8>,
    pub chunk_size: usize,
    /// Number of leading `open` calls that fail
    pub fail_opens: AtomicU32,
    pub fail_mode: FailMode,
    /// Whether byte-range opens succeed
    pub range_supported: bool,
    /// Recorded `(entry, range)` arguments of every open call
    pub open_calls: Mutex<Vec<(Option<String>, Option<(u64, Option<u64>)>)>>,
}

impl MockItem {
    pub fn new(id: &str, body: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            size_kb: body.len() as f64 / 1000.0,
            md5: None,
            url: format!("https://catalog.test/products/{id}"),
            sensing_start: None,
            sensing_end: None,
            entry_names: Some(Vec::new()),
            body: body.to_vec(),
            chunk_size: 4,
            fail_opens: AtomicU32::new(0),
            fail_mode: FailMode::Transient,
            range_supported: true,
            open_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_md5_of_body(mut self) -> Self {
        self.md5 = Some(format!("{:x}", md5::compute(&self.body)));
        self
    }

    pub fn with_md5(mut self, md5: &str) -> Self {
        self.md5 = Some(md5.to_string());
        self
    }

    pub fn with_sensing_start(mut self, dt: DateTime<Utc>) -> Self {
        self.sensing_start = Some(dt);
        self
    }

    pub fn with_entries(mut self, names: &[&str]) -> Self {
        self.entry_names = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_broken_entries(mut self) -> Self {
        self.entry_names = None;
        self
    }

    pub fn failing_first(self, n: u32, mode: FailMode) -> Self {
        self.fail_opens.store(n, Ordering::SeqCst);
        Self {
            fail_mode: mode,
            ..self
        }
    }

    pub fn without_range_support(mut self) -> Self {
        self.range_supported = false;
        self
    }

    #[allow(clippy::unwrap_used)]
    pub fn recorded_opens(&self) -> Vec<(Option<String>, Option<(u64, Option<u64>)>)> {
        self.open_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogItem for MockItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn size_kb(&self) -> f64 {
        self.size_kb
    }

    fn md5(&self) -> Option<&str> {
        self.md5.as_deref()
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn sensing_start(&self) -> Option<DateTime<Utc>> {
        self.sensing_start
    }

    fn sensing_end(&self) -> Option<DateTime<Utc>> {
        self.sensing_end
    }

    async fn entries(&self) -> Result<Vec<String>> {
        self.entry_names
            .clone()
            .ok_or_else(|| Error::Catalog("entry listing unavailable".to_string()))
    }

    #[allow(clippy::unwrap_used)]
    async fn open(
        &self,
        entry: Option<&str>,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<ByteStream> {
        self.open_calls
            .lock()
            .unwrap()
            .push((entry.map(str::to_string), range));

        if self.fail_opens.load(Ordering::SeqCst) > 0 {
            self.fail_opens.fetch_sub(1, Ordering::SeqCst);
            return match self.fail_mode {
                FailMode::Transient => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ))),
                FailMode::Permanent => {
                    Err(Error::InvalidInput("malformed product reference".to_string()))
                }
            };
        }

        let start = match range {
            Some((start, _)) => {
                if !self.range_supported {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "byte ranges not supported",
                    )));
                }
                (start as usize).min(self.body.len())
            }
            None => 0,
        };

        let chunks: Vec<Result<Bytes>> = self.body[start..]
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
