//! Local filesystem backend.
//!
//! Layout: `{root}/{hash[0..2]}/{hash}`. Writes go to a hidden temporary file
//! in the shard directory and are renamed into place, so an interrupted
//! download never leaves a truncated object behind. Hidden files are ignored
//! by enumeration.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::models::StoredFile;
use crate::storage::{hash_from_key, shard, validate_hash, ByteStream, ContentStore, Retrieval};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the file path for an object given its hash.
    fn object_path(&self, hash: &str) -> Result<PathBuf> {
        validate_hash(hash)?;
        Ok(self.root.join(shard(hash)).join(hash))
    }

    async fn write_stream(path: &Path, mut body: ByteStream) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await.map_err(|e| {
            Error::Storage(format!("Failed to create {}: {}", path.display(), e))
        })?;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Transport(format!("Body stream failed: {}", e)))?;
            file.write_all(&chunk).await.map_err(|e| {
                Error::Storage(format!("Failed to write {}: {}", path.display(), e))
            })?;
        }

        file.flush()
            .await
            .map_err(|e| Error::Storage(format!("Failed to flush {}: {}", path.display(), e)))
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to create storage directory {}: {}",
                self.root.display(),
                e
            ))
        })
    }

    async fn check(&self) -> Result<bool> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        // Check writability
        let marker = self.root.join(".check");
        tokio::fs::write(&marker, b"check").await?;
        let _ = tokio::fs::remove_file(&marker).await;
        Ok(true)
    }

    async fn get(&self, hash: &str) -> Result<Option<Retrieval>> {
        let path = self.object_path(hash)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let len = file.metadata().await.ok().map(|m| m.len());

        Ok(Some(Retrieval::Inline {
            body: Box::pin(ReaderStream::new(file)),
            len,
        }))
    }

    async fn put(&self, hash: &str, body: ByteStream) -> Result<()> {
        let path = self.object_path(hash)?;
        let dir = self.root.join(shard(hash));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Storage(format!("Failed to create directory {}: {}", dir.display(), e))
        })?;

        // Unique per writer: the same hash may be written concurrently.
        let partial = dir.join(format!(".{}.{:016x}.part", hash, rand::random::<u64>()));

        if let Err(e) = Self::write_stream(&partial, body).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &path).await.map_err(|e| {
            Error::Storage(format!("Failed to move object into {}: {}", path.display(), e))
        })?;

        tracing::debug!(hash, "Stored object");
        Ok(())
    }

    async fn delete(&self, hash: &str) -> Result<()> {
        let path = self.object_path(hash)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        let path = self.object_path(hash)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Validation(format!("Illegal file path: {}", path)));
        }

        let full = self.root.join(rel);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, &content).await.map_err(|e| {
            Error::Storage(format!("Failed to write {}: {}", full.display(), e))
        })
    }

    async fn list_files(&self) -> Result<Vec<StoredFile>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| Error::Storage(format!("Task join error: {}", e)))?
            .map_err(|e| Error::Storage(format!("Failed to enumerate store: {}", e)))
    }
}

/// Walk the two-level shard tree. A missing root is an empty store.
fn scan(root: &Path) -> io::Result<Vec<StoredFile>> {
    let shards = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for shard_entry in shards {
        let shard_entry = shard_entry?;
        if !shard_entry.file_type()?.is_dir() {
            continue;
        }
        let shard_name = shard_entry.file_name().to_string_lossy().into_owned();
        if shard_name.len() != 2 {
            continue;
        }

        for entry in std::fs::read_dir(shard_entry.path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let key = format!("{}/{}", shard_name, name);
            let Some(hash) = hash_from_key(&key) else {
                continue;
            };

            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            files.push(StoredFile {
                hash: hash.to_string(),
                size: meta.len() as i64,
                mtime,
            });
        }
    }

    Ok(files)
}
