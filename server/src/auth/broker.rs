//! Credential Broker: owns the authority token.
//!
//! Acquisition is a challenge/response exchange:
//! 1. `GET {server}/challenge?clusterId=ID` -> `{challenge}`
//! 2. `signature = hex(HMAC-SHA256(secret, challenge))`
//! 3. `POST {server}/token {clusterId, challenge, signature}` -> 201 `{token, ttl}`
//!
//! After a successful acquisition a single background task refreshes the token
//! every `max(ttl / 2, floor)` by posting `{clusterId, token}` to the same
//! endpoint. The task is cancelled by [`CredentialBroker::shutdown`].
//!
//! The broker never reports to the fault governor: a failed acquisition is
//! returned to the caller, which decides whether it counts.

use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::sign;
use crate::error::{Error, Result};

/// Lower bound on the refresh delay.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// --- Wire types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub cluster_id: String,
    pub challenge: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub cluster_id: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    /// Token lifetime in seconds.
    pub ttl: u64,
}

/// Delay before the next refresh: half the TTL, but never less than `floor`.
pub fn refresh_delay(ttl_secs: u64, floor: Duration) -> Duration {
    Duration::from_secs(ttl_secs / 2).max(floor)
}

/// Cheaply cloneable handle to the shared broker.
#[derive(Clone)]
pub struct CredentialBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    cluster_id: String,
    secret: String,
    server_url: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    refresh_floor: Duration,
    refresh_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl CredentialBroker {
    /// Broker with the production refresh floor, [`MIN_REFRESH_INTERVAL`].
    pub fn new(
        cluster_id: impl Into<String>,
        secret: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Result<Self> {
        Self::with_refresh_floor(cluster_id, secret, server_url, MIN_REFRESH_INTERVAL)
    }

    /// Broker whose refresh delay is never shorter than `refresh_floor`.
    pub fn with_refresh_floor(
        cluster_id: impl Into<String>,
        secret: impl Into<String>,
        server_url: impl Into<String>,
        refresh_floor: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(BrokerInner {
                cluster_id: cluster_id.into(),
                secret: secret.into(),
                server_url: server_url.into().trim_end_matches('/').to_string(),
                http,
                token: RwLock::new(None),
                refresh_floor,
                refresh_task: std::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Return the held token, running the challenge flow first if none is held.
    ///
    /// Concurrent callers with no token serialise on the write lock, so only
    /// one of them talks to the authority.
    pub async fn acquire_token(&self) -> Result<String> {
        if let Some(token) = self.inner.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.inner.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        match self.inner.fetch_token().await {
            Ok(resp) => {
                *slot = Some(resp.token.clone());
                drop(slot);
                tracing::info!(ttl = resp.ttl, "Acquired authority token");
                self.schedule_refresh(resp.ttl);
                Ok(resp.token)
            }
            Err(e) => {
                tracing::warn!("Token acquisition failed: {}", e);
                Err(e)
            }
        }
    }

    /// Currently held token, without triggering acquisition.
    pub async fn current_token(&self) -> Option<String> {
        self.inner.token.read().await.clone()
    }

    /// Stop the refresh task. The held token stays readable.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.lock_refresh_task().take() {
            handle.abort();
        }
    }

    fn schedule_refresh(&self, ttl: u64) {
        let delay = refresh_delay(ttl, self.inner.refresh_floor);
        tracing::debug!(delay_secs = delay.as_secs_f64(), "Scheduling token refresh");

        let handle = tokio::spawn(refresh_loop(
            Arc::downgrade(&self.inner),
            delay,
            self.inner.shutdown.clone(),
        ));

        if let Some(previous) = self.inner.lock_refresh_task().replace(handle) {
            previous.abort();
        }
    }
}

impl BrokerInner {
    fn lock_refresh_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refresh_task.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn fetch_token(&self) -> Result<TokenResponse> {
        let resp = self
            .http
            .get(format!("{}/challenge", self.server_url))
            .query(&[("clusterId", self.cluster_id.as_str())])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Failed to request challenge: {}", e)))?;

        if resp.status() != StatusCode::OK {
            return Err(Error::Auth(format!(
                "Challenge request returned status {}",
                resp.status()
            )));
        }

        let challenge: ChallengeResponse = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Malformed challenge response: {}", e)))?;

        let signature = sign::sign(&self.secret, &challenge.challenge);

        self.post_token(&TokenRequest {
            cluster_id: self.cluster_id.clone(),
            challenge: challenge.challenge,
            signature,
        })
        .await
    }

    async fn refresh(&self) -> Result<u64> {
        let current = self
            .token
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Auth("No token held to refresh".to_string()))?;

        let resp = self
            .post_token(&RefreshRequest {
                cluster_id: self.cluster_id.clone(),
                token: current,
            })
            .await?;

        *self.token.write().await = Some(resp.token);
        Ok(resp.ttl)
    }

    async fn post_token<B: Serialize>(&self, body: &B) -> Result<TokenResponse> {
        let resp = self
            .http
            .post(format!("{}/token", self.server_url))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Failed to request token: {}", e)))?;

        if resp.status() != StatusCode::CREATED {
            return Err(Error::Auth(format!(
                "Token request returned status {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Auth(format!("Malformed token response: {}", e)))
    }
}

async fn refresh_loop(inner: Weak<BrokerInner>, mut delay: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Token refresh cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };

        match inner.refresh().await {
            Ok(ttl) => {
                delay = refresh_delay(ttl, inner.refresh_floor);
                tracing::info!(ttl, "Refreshed authority token");
            }
            Err(e) => {
                // No retry. Dropping the token makes the next caller redo the challenge.
                tracing::warn!("Token refresh failed: {}", e);
                *inner.token.write().await = None;
                return;
            }
        }
    }
}
