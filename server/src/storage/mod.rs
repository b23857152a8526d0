//! Content-addressed object storage for the mirror node.
//!
//! Objects are addressed by their content hash alone. Every backend lays them
//! out as `{root}/{hash[0..2]}/{hash}`; membership, listing and last-modified
//! are all derived by enumerating that tree, there is no secondary index.
//!
//! Backends:
//! - [`file::LocalStore`]: local filesystem, serves bytes inline.
//! - [`webdav::WebDavStore`]: remote WebDAV share, serves redirects.
//! - [`alist::AListStore`]: remote file-API server, serves redirects.

pub mod alist;
pub mod file;
pub mod routes;
pub mod webdav;

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::models::{ContentEntry, GcReport, StoredFile};

/// Body handed to [`ContentStore::put`] and returned by inline retrievals.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// What a `get` yields: bytes to stream, or a URL the client should fetch instead.
pub enum Retrieval {
    Inline { body: ByteStream, len: Option<u64> },
    Redirect(String),
}

impl std::fmt::Debug for Retrieval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Retrieval::Inline { len, .. } => f.debug_struct("Inline").field("len", len).finish(),
            Retrieval::Redirect(url) => f.debug_tuple("Redirect").field(url).finish(),
        }
    }
}

/// The capability set shared by every storage backend.
///
/// `compute_missing`, `garbage_collect` and `last_modified` have default
/// implementations built on a full `list_files` enumeration; a backend with a
/// persisted index can override them without changing their contract.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Prepare the backend (create the root, log in, ...).
    async fn init(&self) -> Result<()>;

    /// Whether the backend is reachable and writable.
    async fn check(&self) -> Result<bool>;

    /// Look up an object. `Ok(None)` means it is absent.
    async fn get(&self, hash: &str) -> Result<Option<Retrieval>>;

    /// Store an object, replacing any existing one with the same hash.
    async fn put(&self, hash: &str, body: ByteStream) -> Result<()>;

    /// Remove an object. Removing an absent object succeeds.
    async fn delete(&self, hash: &str) -> Result<()>;

    async fn exists(&self, hash: &str) -> Result<bool>;

    /// Write an arbitrary file at `path` relative to the store root.
    async fn write_file(&self, path: &str, content: Bytes) -> Result<()>;

    /// Enumerate every stored object.
    async fn list_files(&self) -> Result<Vec<StoredFile>>;

    /// Candidates whose hash is not stored, de-duplicated by hash.
    async fn compute_missing(&self, candidates: &[ContentEntry]) -> Result<Vec<ContentEntry>> {
        let stored = self.list_files().await?;
        Ok(missing_from(
            stored.iter().map(|f| f.hash.as_str()),
            candidates,
        ))
    }

    /// Delete every stored object whose hash is not in `retain`.
    ///
    /// Best effort: a failed delete is logged and the sweep carries on.
    async fn garbage_collect(&self, retain: &[ContentEntry]) -> Result<GcReport> {
        let keep: HashSet<&str> = retain.iter().map(|e| e.hash.as_str()).collect();
        let stored = self.list_files().await?;

        let mut report = GcReport::default();
        for file in stored.iter().filter(|f| !keep.contains(f.hash.as_str())) {
            match self.delete(&file.hash).await {
                Ok(()) => {
                    tracing::debug!(hash = %file.hash, "Collected unreferenced object");
                    report.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(hash = %file.hash, "Failed to collect object: {}", e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            backend = self.kind(),
            deleted = report.deleted,
            failed = report.failed,
            "Garbage collection complete"
        );
        Ok(report)
    }

    /// Newest modification time across stored objects (unix seconds), 0 when empty.
    async fn last_modified(&self) -> Result<i64> {
        let stored = self.list_files().await?;
        Ok(stored.iter().map(|f| f.mtime).max().unwrap_or(0))
    }
}

/// Set difference of `candidates` against `stored` hashes, keeping the first
/// candidate for each hash and the candidates' order.
pub fn missing_from<'a>(
    stored: impl IntoIterator<Item = &'a str>,
    candidates: &[ContentEntry],
) -> Vec<ContentEntry> {
    let stored: HashSet<&str> = stored.into_iter().collect();
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|c| !stored.contains(c.hash.as_str()) && seen.insert(c.hash.as_str()))
        .cloned()
        .collect()
}

/// Reject hashes that cannot be stored safely: shorter than a shard, or
/// containing anything but ASCII letters and digits.
pub fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() < 2 || !hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::Validation(format!("Malformed hash: {:?}", hash)));
    }
    Ok(())
}

/// Shard directory name: the first two characters of the hash.
pub fn shard(hash: &str) -> &str {
    &hash[..2]
}

/// `{shard}/{hash}`, the object's key relative to the store root.
pub fn object_key(hash: &str) -> String {
    format!("{}/{}", shard(hash), hash)
}

/// Recover a hash from a path relative to the store root, if it follows the
/// `{shard}/{hash}` layout.
pub fn hash_from_key(rel: &str) -> Option<&str> {
    let (dir, name) = rel.trim_matches('/').split_once('/')?;
    if dir.len() != 2 || name.contains('/') || !name.starts_with(dir) {
        return None;
    }
    validate_hash(name).ok().map(|_| name)
}

/// Wrap an in-memory buffer as a [`ByteStream`].
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures_util::stream::once(async move { Ok(data) }))
}

/// Drain a [`ByteStream`] into memory. Remote backends need a replayable body.
pub async fn collect_stream(mut body: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Error::Transport(format!("Body stream failed: {}", e)))?;
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Build the backend selected by `config.kind`.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn ContentStore>> {
    match config.kind.as_str() {
        "file" => Ok(Arc::new(file::LocalStore::new(&config.path))),
        "webdav" => Ok(Arc::new(webdav::WebDavStore::new(&config.webdav)?)),
        "alist" => Ok(Arc::new(alist::AListStore::new(&config.alist)?)),
        other => Err(Error::Storage(format!("Unsupported storage kind: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, hash: &str) -> ContentEntry {
        ContentEntry {
            path: path.to_string(),
            hash: hash.to_string(),
            size: 1,
            mtime: 0,
        }
    }

    #[test]
    fn test_missing_from_is_set_difference() {
        let candidates = vec![entry("/a", "aa01"), entry("/b", "bb02"), entry("/c", "cc03")];
        let missing = missing_from(["bb02"], &candidates);
        assert_eq!(missing, vec![entry("/a", "aa01"), entry("/c", "cc03")]);
    }

    #[test]
    fn test_missing_from_dedupes_by_hash() {
        let candidates = vec![entry("/a", "aa01"), entry("/copy-of-a", "aa01")];
        let missing = missing_from(std::iter::empty(), &candidates);
        assert_eq!(missing, vec![entry("/a", "aa01")]);
    }

    #[test]
    fn test_validate_hash() {
        assert!(validate_hash("abc123").is_ok());
        assert!(validate_hash("ab").is_ok());
        assert!(validate_hash("a").is_err());
        assert!(validate_hash("").is_err());
        assert!(validate_hash("..").is_err());
        assert!(validate_hash("ab/cd").is_err());
        assert!(validate_hash("ab%2f").is_err());
    }

    #[test]
    fn test_object_key_layout() {
        assert_eq!(shard("abcdef"), "ab");
        assert_eq!(object_key("abcdef"), "ab/abcdef");
    }

    #[test]
    fn test_hash_from_key() {
        assert_eq!(hash_from_key("ab/abcdef"), Some("abcdef"));
        assert_eq!(hash_from_key("/ab/abcdef/"), Some("abcdef"));
        assert_eq!(hash_from_key("abcdef"), None);
        assert_eq!(hash_from_key("abc/abcdef"), None);
        assert_eq!(hash_from_key("ab/cdef"), None);
        assert_eq!(hash_from_key("ab/x/abcdef"), None);
    }
}
