//! Download pool for missing entries.
//!
//! At most `concurrency` downloads are in flight, submissions are spaced by
//! `start_interval`, and every download is retried with linear backoff before
//! it counts as failed. A failed entry never aborts its siblings.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::models::{ContentEntry, SyncReport};
use crate::storage::ContentStore;
use crate::sync::authority::AuthorityClient;

/// Tries per entry before it is counted as failed.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub start_interval: Duration,
    /// Retry `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for FetchOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency(),
            start_interval: config.start_interval(),
            retry_backoff: config.retry_backoff(),
            max_attempts: MAX_DOWNLOAD_ATTEMPTS,
        }
    }
}

/// Download every entry into `store` and tally the outcome.
pub async fn fetch_missing(
    client: &AuthorityClient,
    store: Arc<dyn ContentStore>,
    missing: Vec<ContentEntry>,
    options: &FetchOptions,
) -> SyncReport {
    let total = missing.len();
    let gate = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let progress = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();

    tracing::info!(
        total,
        concurrency = options.concurrency,
        "Downloading missing files"
    );

    for (i, entry) in missing.into_iter().enumerate() {
        if i > 0 && !options.start_interval.is_zero() {
            tokio::time::sleep(options.start_interval).await;
        }

        // Admission happens before spawn, so at most `concurrency` tasks exist.
        let Ok(permit) = gate.clone().acquire_owned().await else {
            break;
        };

        let client = client.clone();
        let store = store.clone();
        let progress = progress.clone();
        let options = options.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let ok = download_with_retry(&client, store.as_ref(), &entry, &options).await;
            let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(done, total, hash = %entry.hash, ok, "Download finished");
            ok
        });
    }

    let mut report = SyncReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => report.succeeded += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                tracing::error!("Download task panicked: {}", e);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        "Download pass complete"
    );
    report
}

async fn download_with_retry(
    client: &AuthorityClient,
    store: &dyn ContentStore,
    entry: &ContentEntry,
    options: &FetchOptions,
) -> bool {
    for attempt in 1..=options.max_attempts {
        match download_once(client, store, entry).await {
            Ok(()) => return true,
            Err(e) => {
                tracing::warn!(
                    hash = %entry.hash,
                    path = %entry.path,
                    attempt,
                    "Download failed: {}",
                    e
                );
                if attempt < options.max_attempts {
                    tokio::time::sleep(options.retry_backoff * attempt).await;
                }
            }
        }
    }

    tracing::error!(hash = %entry.hash, path = %entry.path, "Giving up on file");
    false
}

/// Stream one entry straight from the authority into the store.
async fn download_once(
    client: &AuthorityClient,
    store: &dyn ContentStore,
    entry: &ContentEntry,
) -> Result<()> {
    let resp = client
        .get_expecting(&entry.path, &[], &[StatusCode::OK])
        .await?;
    let body = resp.bytes_stream().map_err(io::Error::other);
    store.put(&entry.hash, Box::pin(body)).await
}
