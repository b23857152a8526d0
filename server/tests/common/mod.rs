//! Shared helpers for integration tests: a mock authority server and a few
//! constructors.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use mirror_node::auth::broker::CredentialBroker;
use mirror_node::auth::sign;
use mirror_node::config::SyncConfig;
use mirror_node::fault::FaultGovernor;
use mirror_node::models::ContentEntry;
use mirror_node::sync::authority::AuthorityClient;
use mirror_node::sync::manifest::encode_manifest;

pub const CLUSTER_ID: &str = "test-cluster";
pub const SECRET: &str = "test-secret";

/// Serve `router` on an ephemeral port and return its base URL.
pub async fn spawn(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Governor whose fatal action only records that it fired.
pub fn test_governor(threshold: u32) -> (Arc<FaultGovernor>, Arc<AtomicU32>) {
    let fired = Arc::new(AtomicU32::new(0));
    let hook = fired.clone();
    let governor = FaultGovernor::with_fatal_action(
        threshold,
        Box::new(move |count| {
            hook.store(count, Ordering::SeqCst);
        }),
    );
    (Arc::new(governor), fired)
}

pub fn entry(path: &str, hash: &str, size: i64) -> ContentEntry {
    ContentEntry {
        path: path.to_string(),
        hash: hash.to_string(),
        size,
        mtime: 0,
    }
}

/// Sync tunables that keep tests fast.
pub fn fast_sync_config(max_concurrency: i64) -> SyncConfig {
    SyncConfig {
        max_concurrency,
        start_interval_ms: 0,
        retry_backoff_ms: 10,
        ..SyncConfig::default()
    }
}

/// Observable state of the mock authority.
#[derive(Default)]
pub struct AuthorityState {
    pub ttl: AtomicU64,
    pub challenges_issued: AtomicUsize,
    pub open_challenges: Mutex<HashSet<String>>,
    pub valid_tokens: Mutex<HashSet<String>>,
    /// Every body posted to /token, in order.
    pub token_posts: Mutex<Vec<Value>>,
    pub refresh_fails: AtomicBool,

    /// `None` answers 204.
    pub manifest: Mutex<Option<Vec<ContentEntry>>>,
    pub corrupt_manifest: AtomicBool,
    pub manifest_requests: AtomicUsize,
    pub last_modified_seen: Mutex<Vec<i64>>,

    /// Downloadable files by request path.
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    /// Remaining forced 500s per path.
    pub failures: Mutex<HashMap<String, u32>>,
    /// Requests per path, including failed ones.
    pub requests: Mutex<HashMap<String, usize>>,
    pub download_delay: Mutex<Duration>,
    /// Paths whose requests are accepted but never answered.
    pub stalled: Mutex<HashSet<String>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub downloads_ok: AtomicUsize,
}

impl AuthorityState {
    pub fn add_file(&self, entry: &ContentEntry, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(entry.path.clone(), content.to_vec());
    }

    pub fn set_manifest(&self, entries: Option<Vec<ContentEntry>>) {
        *self.manifest.lock().unwrap() = entries;
    }

    pub fn fail_times(&self, path: &str, times: u32) {
        self.failures.lock().unwrap().insert(path.to_string(), times);
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn refresh_posts(&self) -> Vec<Value> {
        self.token_posts
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.get("token").is_some())
            .cloned()
            .collect()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|t| self.valid_tokens.lock().unwrap().contains(t))
    }

    fn issue_token(&self, prefix: &str) -> Value {
        let n = self.valid_tokens.lock().unwrap().len() + 1;
        let token = format!("{}-{}", prefix, n);
        self.valid_tokens.lock().unwrap().insert(token.clone());
        json!({ "token": token, "ttl": self.ttl.load(Ordering::SeqCst) })
    }
}

pub struct MockAuthority {
    pub url: String,
    pub state: Arc<AuthorityState>,
}

impl MockAuthority {
    pub async fn start() -> Self {
        let state = Arc::new(AuthorityState::default());
        state.ttl.store(3600, Ordering::SeqCst);

        let router = Router::new()
            .route("/challenge", get(challenge))
            .route("/token", post(token))
            .route("/files", get(files))
            .fallback(download)
            .with_state(state.clone());

        Self {
            url: spawn(router).await,
            state,
        }
    }

    pub fn broker(&self) -> CredentialBroker {
        CredentialBroker::new(CLUSTER_ID, SECRET, &self.url).unwrap()
    }

    pub fn broker_with_floor(&self, floor: Duration) -> CredentialBroker {
        CredentialBroker::with_refresh_floor(CLUSTER_ID, SECRET, &self.url, floor).unwrap()
    }

    pub fn client(&self) -> AuthorityClient {
        self.client_with(SECRET, Duration::from_secs(30))
    }

    /// Client whose broker signs with `secret` and whose reads give up after
    /// `read_timeout` of silence.
    pub fn client_with(&self, secret: &str, read_timeout: Duration) -> AuthorityClient {
        let broker = CredentialBroker::new(CLUSTER_ID, secret, &self.url).unwrap();
        AuthorityClient::new(&self.url, broker, read_timeout).unwrap()
    }
}

async fn challenge(
    State(state): State<Arc<AuthorityState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("clusterId").map(String::as_str) != Some(CLUSTER_ID) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let n = state.challenges_issued.fetch_add(1, Ordering::SeqCst) + 1;
    let challenge = format!("challenge-{}", n);
    state
        .open_challenges
        .lock()
        .unwrap()
        .insert(challenge.clone());
    Json(json!({ "challenge": challenge })).into_response()
}

async fn token(State(state): State<Arc<AuthorityState>>, Json(body): Json<Value>) -> Response {
    state.token_posts.lock().unwrap().push(body.clone());

    if body["clusterId"] != CLUSTER_ID {
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(old) = body.get("token").and_then(Value::as_str) {
        if state.refresh_fails.load(Ordering::SeqCst)
            || !state.valid_tokens.lock().unwrap().contains(old)
        {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        return (StatusCode::CREATED, Json(state.issue_token("refreshed"))).into_response();
    }

    let challenge = body["challenge"].as_str().unwrap_or_default().to_string();
    let signature = body["signature"].as_str().unwrap_or_default();
    let known = state.open_challenges.lock().unwrap().remove(&challenge);
    if !known || signature != sign::sign(SECRET, &challenge) {
        return StatusCode::FORBIDDEN.into_response();
    }

    (StatusCode::CREATED, Json(state.issue_token("token"))).into_response()
}

async fn files(
    State(state): State<Arc<AuthorityState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.manifest_requests.fetch_add(1, Ordering::SeqCst);
    if let Some(lm) = params.get("lastModified").and_then(|v| v.parse().ok()) {
        state.last_modified_seen.lock().unwrap().push(lm);
    }

    if state.corrupt_manifest.load(Ordering::SeqCst) {
        return (StatusCode::OK, "not a manifest").into_response();
    }

    let manifest = state.manifest.lock().unwrap().clone();
    match manifest {
        None => StatusCode::NO_CONTENT.into_response(),
        Some(entries) => match encode_manifest(&entries) {
            Ok(body) => (StatusCode::OK, body).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
    }
}

async fn download(State(state): State<Arc<AuthorityState>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    *state.requests.lock().unwrap().entry(path.clone()).or_default() += 1;

    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let stalled = state.stalled.lock().unwrap().contains(&path);
    if stalled {
        std::future::pending::<()>().await;
    }

    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(current, Ordering::SeqCst);

    let delay = *state.download_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let forced_failure = {
        let mut failures = state.failures.lock().unwrap();
        match failures.get_mut(&path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    };

    let content = state.files.lock().unwrap().get(&path).cloned();
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    if forced_failure {
        return (StatusCode::INTERNAL_SERVER_ERROR, "try again").into_response();
    }
    match content {
        Some(bytes) => {
            state.downloads_ok.fetch_add(1, Ordering::SeqCst);
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::from(bytes))
                .unwrap()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
