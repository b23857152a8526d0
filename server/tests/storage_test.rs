//! Integration tests for content store semantics shared by all backends,
//! exercised through the local backend.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use mirror_node::error::{Error, Result};
use mirror_node::models::{ContentEntry, GcReport, StoredFile};
use mirror_node::storage::file::LocalStore;
use mirror_node::storage::{collect_stream, stream_from_bytes, ByteStream, ContentStore, Retrieval};

/// Local store whose deletes fail for selected hashes.
struct FailingDelete {
    inner: LocalStore,
    fail_on: HashSet<String>,
}

#[async_trait]
impl ContentStore for FailingDelete {
    fn kind(&self) -> &'static str {
        "failing-delete"
    }
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }
    async fn check(&self) -> Result<bool> {
        self.inner.check().await
    }
    async fn get(&self, hash: &str) -> Result<Option<Retrieval>> {
        self.inner.get(hash).await
    }
    async fn put(&self, hash: &str, body: ByteStream) -> Result<()> {
        self.inner.put(hash, body).await
    }
    async fn delete(&self, hash: &str) -> Result<()> {
        if self.fail_on.contains(hash) {
            return Err(Error::Storage(format!("simulated failure deleting {}", hash)));
        }
        self.inner.delete(hash).await
    }
    async fn exists(&self, hash: &str) -> Result<bool> {
        self.inner.exists(hash).await
    }
    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        self.inner.write_file(path, content).await
    }
    async fn list_files(&self) -> Result<Vec<StoredFile>> {
        self.inner.list_files().await
    }
}

fn retain(hashes: &[&str]) -> Vec<ContentEntry> {
    hashes
        .iter()
        .map(|h| ContentEntry {
            path: format!("/files/{}", h),
            hash: h.to_string(),
            size: 1,
            mtime: 0,
        })
        .collect()
}

async fn held(store: &dyn ContentStore) -> Vec<String> {
    let mut hashes: Vec<_> = store
        .list_files()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.hash)
        .collect();
    hashes.sort();
    hashes
}

async fn seeded(hashes: &[&str]) -> (tempfile::TempDir, LocalStore) {
    let tmp = tempfile::tempdir().unwrap();
    let store = LocalStore::new(tmp.path());
    store.init().await.unwrap();
    for h in hashes {
        store.put(h, stream_from_bytes(h.to_string())).await.unwrap();
    }
    (tmp, store)
}

#[tokio::test]
async fn test_scenario_e_gc_keeps_exactly_retained() {
    let (_tmp, store) = seeded(&["aa0001", "bb0002", "cc0003"]).await;

    let report = store
        .garbage_collect(&retain(&["aa0001", "bb0002"]))
        .await
        .unwrap();

    assert_eq!(report, GcReport { deleted: 1, failed: 0 });
    assert_eq!(held(&store).await, vec!["aa0001", "bb0002"]);
}

#[tokio::test]
async fn test_scenario_e_failed_delete_does_not_stop_sweep() {
    let (_tmp, inner) = seeded(&["aa0001", "bb0002", "cc0003", "dd0004"]).await;
    let store = FailingDelete {
        inner,
        fail_on: HashSet::from(["cc0003".to_string()]),
    };

    let report = store
        .garbage_collect(&retain(&["aa0001", "bb0002"]))
        .await
        .unwrap();

    assert_eq!(report, GcReport { deleted: 1, failed: 1 });
    // Nothing is rolled back: dd0004 stays deleted, cc0003 survives its failure.
    assert_eq!(held(&store).await, vec!["aa0001", "bb0002", "cc0003"]);

    // A later sweep is safe to repeat.
    let fixed = FailingDelete {
        inner: store.inner,
        fail_on: HashSet::new(),
    };
    let report = fixed
        .garbage_collect(&retain(&["aa0001", "bb0002"]))
        .await
        .unwrap();
    assert_eq!(report, GcReport { deleted: 1, failed: 0 });
    assert_eq!(held(&fixed).await, vec!["aa0001", "bb0002"]);
}

#[tokio::test]
async fn test_gc_with_empty_store_is_noop() {
    let (_tmp, store) = seeded(&[]).await;
    let report = store.garbage_collect(&retain(&["aa0001"])).await.unwrap();
    assert_eq!(report, GcReport::default());
}

#[tokio::test]
async fn test_concurrent_puts_of_same_hash() {
    let (_tmp, store) = seeded(&[]).await;
    let store = Arc::new(store);

    let writers = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .put("abc123", stream_from_bytes("identical content"))
                .await
        })
    });
    for result in futures_util::future::join_all(writers).await {
        result.unwrap().unwrap();
    }

    assert_eq!(held(store.as_ref()).await, vec!["abc123"]);
    match store.get("abc123").await.unwrap() {
        Some(Retrieval::Inline { body, len }) => {
            assert_eq!(len, Some(17));
            assert_eq!(
                collect_stream(body).await.unwrap().as_ref(),
                b"identical content"
            );
        }
        other => panic!("expected inline, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reads_during_writes() {
    let (_tmp, store) = seeded(&["abc123"]).await;
    let store = Arc::new(store);

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                store
                    .put("def456", stream_from_bytes(format!("v{}", i)))
                    .await
                    .unwrap();
            }
        })
    };
    for _ in 0..20 {
        assert!(store.exists("abc123").await.unwrap());
        assert!(store.get("abc123").await.unwrap().is_some());
    }
    writer.await.unwrap();

    assert_eq!(held(store.as_ref()).await, vec!["abc123", "def456"]);
}

#[tokio::test]
async fn test_compute_missing_dedupes_manifest_paths() {
    let (_tmp, store) = seeded(&[]).await;
    let mut candidates = retain(&["aa0001"]);
    candidates.push(ContentEntry {
        path: "/mirror/aa0001".into(),
        hash: "aa0001".into(),
        size: 1,
        mtime: 0,
    });

    let missing = store.compute_missing(&candidates).await.unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].path, "/files/aa0001");
}

#[tokio::test]
async fn test_open_selects_backend() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = mirror_node::config::StorageConfig {
        path: tmp.path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    assert_eq!(mirror_node::storage::open(&config).unwrap().kind(), "file");

    config.kind = "webdav".into();
    config.webdav.endpoint = "http://127.0.0.1:1".into();
    assert_eq!(mirror_node::storage::open(&config).unwrap().kind(), "webdav");

    config.kind = "alist".into();
    config.alist.endpoint = "http://127.0.0.1:1".into();
    assert_eq!(mirror_node::storage::open(&config).unwrap().kind(), "alist");

    config.kind = "ftp".into();
    assert!(matches!(
        mirror_node::storage::open(&config),
        Err(Error::Storage(_))
    ));
}
