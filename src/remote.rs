//! Lazy remote views over authenticated HTTP
//!
//! A [`RemoteDataset`] bundles the entries of one catalog item as
//! `{entry name → URL}` over a single shared [`AuthTransport`], so bearer
//! token refreshes are coordinated across all concurrent reads of that
//! item. Each entry opens as a seekable [`RemoteFile`] that reads small
//! byte slices of a large remote object without transferring it.

use crate::catalog::CatalogItem;
use crate::error::{Error, Result};
use crate::transport::AuthTransport;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;

/// One named entry of a remote dataset
#[derive(Clone)]
pub struct RemoteEntry {
    url: String,
    transport: Arc<AuthTransport>,
}

impl RemoteEntry {
    /// Fully qualified (pre-percent-encoded) URL of this entry
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the entry as a seekable byte stream.
    ///
    /// Stats the object once so `len` and end-relative seeks work.
    pub async fn open(&self) -> Result<RemoteFile> {
        let len = self.transport.content_length(&self.url).await?;
        Ok(RemoteFile {
            url: self.url.clone(),
            transport: self.transport.clone(),
            len,
            pos: 0,
        })
    }

    /// Read an absolute byte range without opening a handle
    pub async fn read_range(&self, start: u64, end: Option<u64>) -> Result<Bytes> {
        self.transport.read_range(&self.url, start, end).await
    }
}

/// Seekable random-access reader over one remote object.
///
/// Every read issues a byte-range request through the shared transport;
/// nothing is buffered locally.
pub struct RemoteFile {
    url: String,
    transport: Arc<AuthTransport>,
    len: Option<u64>,
    pos: u64,
}

impl RemoteFile {
    /// Object length, when the server reported one
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// True when the server reported a zero length
    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }

    /// Current read position
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Move the read position
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos: i64 = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => {
                let len = self.len.ok_or_else(|| {
                    Error::InvalidInput("cannot seek from end: object length unknown".to_string())
                })?;
                len as i64 + delta
            }
        };
        if new_pos < 0 {
            return Err(Error::InvalidInput("seek before start of object".to_string()));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    /// Read up to `len` bytes at the current position, advancing it.
    ///
    /// Returns an empty buffer at end of object.
    pub async fn read(&mut self, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        if let Some(total) = self.len
            && self.pos >= total
        {
            return Ok(Bytes::new());
        }
        let end = self.pos + len as u64 - 1;
        let bytes = self
            .transport
            .read_range(&self.url, self.pos, Some(end))
            .await?;
        self.pos += bytes.len() as u64;
        Ok(bytes)
    }

    /// Read an absolute byte range without touching the position
    pub async fn read_range(&self, start: u64, end: Option<u64>) -> Result<Bytes> {
        self.transport.read_range(&self.url, start, end).await
    }
}

/// A catalog item's worth of entries sharing one authenticated transport
pub struct RemoteDataset {
    entries: BTreeMap<String, RemoteEntry>,
}

impl RemoteDataset {
    /// Build a dataset from `{entry name → URL}` pairs.
    ///
    /// URLs must already be percent-encoded; they pass through the
    /// transport without re-encoding.
    pub fn new(entries: BTreeMap<String, String>, transport: Arc<AuthTransport>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(name, url)| {
                (
                    name,
                    RemoteEntry {
                        url,
                        transport: transport.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Entry by name
    pub fn get(&self, name: &str) -> Option<&RemoteEntry> {
        self.entries.get(name)
    }

    /// Names of all entries, sorted
    pub fn entry_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Iterate over `(name, entry)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RemoteEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the dataset has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build a lazy remote view from a catalog item.
///
/// Each entry URL is the item's base URL extended with
/// `/entry?name=<percent-encoded-name>`; `patterns` optionally restricts
/// the entries by glob match.
pub async fn build_remote_dataset(
    item: &dyn CatalogItem,
    transport: Arc<AuthTransport>,
    patterns: Option<&[String]>,
) -> Result<RemoteDataset> {
    let compiled = match patterns {
        Some(patterns) => Some(compile_patterns(patterns)?),
        None => None,
    };

    let mut entries = BTreeMap::new();
    for name in item.entries().await? {
        let keep = match &compiled {
            Some(patterns) => patterns.iter().any(|p| p.matches(&name)),
            None => true,
        };
        if keep {
            let url = format!("{}/entry?name={}", item.url(), urlencoding::encode(&name));
            entries.insert(name, url);
        }
    }

    Ok(RemoteDataset::new(entries, transport))
}

pub(crate) fn compile_patterns(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| Error::InvalidInput(format!("invalid entry pattern '{p}': {e}")))
        })
        .collect()
}
