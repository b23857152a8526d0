//! The reconciliation engine.
//!
//! An attempt checks the store, fetches the manifest scoped by the store's
//! last-modified time, diffs, and downloads what is missing. A run retries
//! whole attempts with linear backoff and reports to the fault governor only
//! once it has run out of attempts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::fault::FaultGovernor;
use crate::models::{ContentEntry, GcReport, SyncReport};
use crate::storage::ContentStore;
use crate::sync::authority::AuthorityClient;
use crate::sync::fetch::{self, FetchOptions};
use crate::sync::manifest;

/// Whole-attempt tries per run.
pub const MAX_SYNC_ATTEMPTS: u32 = 5;

/// Result of one successful attempt.
#[derive(Debug, Clone, Default)]
pub struct Pass {
    pub manifest: Vec<ContentEntry>,
    pub report: SyncReport,
}

pub struct Reconciler {
    client: AuthorityClient,
    store: Arc<dyn ContentStore>,
    governor: Arc<FaultGovernor>,
    fetch: FetchOptions,
    max_attempts: u32,
    attempt_backoff: Duration,
    gc: bool,
    manifest_dump: Option<PathBuf>,
}

impl Reconciler {
    pub fn new(
        client: AuthorityClient,
        store: Arc<dyn ContentStore>,
        governor: Arc<FaultGovernor>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            client,
            store,
            governor,
            fetch: FetchOptions::from(config),
            max_attempts: MAX_SYNC_ATTEMPTS,
            attempt_backoff: config.retry_backoff(),
            gc: config.gc,
            manifest_dump: config.manifest_dump().map(PathBuf::from),
        }
    }

    pub fn with_fetch_options(mut self, fetch: FetchOptions) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_attempts(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.attempt_backoff = backoff;
        self
    }

    /// One attempt: check -> fetch manifest -> diff -> download.
    ///
    /// Any failed download makes the attempt an error; the retry re-diffs so
    /// only what is still missing is fetched again.
    pub async fn sync_once(&self) -> Result<Pass> {
        if !self.store.check().await? {
            return Err(Error::Storage(format!(
                "{} store is not ready",
                self.store.kind()
            )));
        }

        let last_modified = match self.store.last_modified().await {
            Ok(lm) => lm,
            Err(e) => {
                tracing::warn!("Failed to read last modified time, requesting full manifest: {}", e);
                0
            }
        };

        let manifest = manifest::fetch(&self.client, last_modified).await?;

        if let Some(path) = &self.manifest_dump {
            match manifest::save_json(path, &manifest).await {
                Ok(()) => tracing::info!(path = %path.display(), "Saved manifest"),
                Err(e) => tracing::warn!("Failed to save manifest: {}", e),
            }
        }

        let missing = self.store.compute_missing(&manifest).await?;
        if missing.is_empty() {
            tracing::info!(entries = manifest.len(), "Store is up to date");
            return Ok(Pass {
                manifest,
                report: SyncReport::default(),
            });
        }

        tracing::info!(
            entries = manifest.len(),
            missing = missing.len(),
            "Reconciling store"
        );
        let report =
            fetch::fetch_missing(&self.client, self.store.clone(), missing, &self.fetch).await;

        if report.failed > 0 {
            return Err(Error::Transport(format!(
                "{} of {} downloads failed",
                report.failed,
                report.total()
            )));
        }

        Ok(Pass { manifest, report })
    }

    /// Run attempts until one succeeds or the budget is spent.
    pub async fn run(&self) -> Result<SyncReport> {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match self.sync_once().await {
                Ok(pass) => {
                    self.governor.reset();
                    if self.gc {
                        self.collect_garbage(&pass.manifest).await;
                    }
                    return Ok(pass.report);
                }
                Err(e) => {
                    tracing::warn!(attempt, max = self.max_attempts, "Sync attempt failed: {}", e);
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.attempt_backoff * attempt).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| Error::Transport("sync never attempted".to_string()));
        self.governor.record_failure(&err);
        Err(err)
    }

    async fn collect_garbage(&self, manifest: &[ContentEntry]) -> Option<GcReport> {
        // An empty manifest (204) says nothing about what to keep.
        if manifest.is_empty() {
            tracing::info!("Skipping garbage collection, manifest is empty");
            return None;
        }
        match self.store.garbage_collect(manifest).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Garbage collection failed: {}", e);
                None
            }
        }
    }
}
