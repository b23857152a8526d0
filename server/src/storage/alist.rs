//! AList file-API backend.
//!
//! Every filesystem call carries the session token in `Authorization`. The
//! token is either configured up front or obtained by logging in during
//! `init`. Downloads redirect to the server's direct-link route,
//! `{endpoint}/d{path}/{shard}/{hash}`.

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::AListConfig;
use crate::error::{Error, Result};
use crate::models::StoredFile;
use crate::storage::{
    collect_stream, hash_from_key, object_key, shard, validate_hash, ByteStream, ContentStore,
    Retrieval,
};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// --- Wire types ---

#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Serialize)]
struct PathRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    path: &'a str,
    page: u32,
    per_page: u32,
    refresh: bool,
}

#[derive(Debug, Serialize)]
struct RemoveRequest<'a> {
    dir: &'a str,
    names: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct ListData {
    #[serde(default)]
    pub content: Option<Vec<FsObject>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsObject {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub is_dir: bool,
    /// Either unix seconds or an RFC 3339 string, depending on the server.
    #[serde(default)]
    pub modified: serde_json::Value,
}

impl FsObject {
    pub fn mtime(&self) -> i64 {
        match &self.modified {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            serde_json::Value::String(s) => s
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    chrono::DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|t| t.timestamp())
                })
                .unwrap_or(0),
            _ => 0,
        }
    }
}

fn is_not_found(message: &str) -> bool {
    message.to_ascii_lowercase().contains("not found")
}

/// RFC 3986 unreserved characters plus `/` pass through; everything else is
/// percent-encoded.
const PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Encode a path for the `File-Path` header.
fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_SET).to_string()
}

pub struct AListStore {
    http: reqwest::Client,
    endpoint: String,
    /// Root directory on the server, `/` or `/a/b`.
    root: String,
    username: String,
    password: String,
    token: RwLock<String>,
}

impl AListStore {
    pub fn new(config: &AListConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Storage(format!("Failed to build AList client: {}", e)))?;

        let trimmed = config.path.trim_matches('/');
        let root = format!("/{}", trimmed);

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            root,
            username: config.username.clone(),
            password: config.password.clone(),
            token: RwLock::new(config.token.clone()),
        })
    }

    /// Absolute server path of `rel` under the root.
    fn path(&self, rel: &str) -> String {
        let rel = rel.trim_matches('/');
        match (self.root.as_str(), rel) {
            ("/", "") => "/".to_string(),
            ("/", rel) => format!("/{}", rel),
            (root, "") => root.to_string(),
            (root, rel) => format!("{}/{}", root, rel),
        }
    }

    fn api(&self, route: &str) -> String {
        format!("{}/api{}", self.endpoint, route)
    }

    async fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(reqwest::header::AUTHORIZATION, self.token.read().await.as_str())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<ApiResponse<T>> {
        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("AList {} request failed: {}", what, e)))?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::Storage(format!("AList {} returned {}", what, status)));
        }

        resp.json()
            .await
            .map_err(|e| Error::Storage(format!("Malformed AList {} response: {}", what, e)))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        route: &str,
        body: &B,
    ) -> Result<ApiResponse<T>> {
        let builder = self.authed(self.http.post(self.api(route)).json(body)).await;
        self.call(builder, route).await
    }

    async fn login(&self) -> Result<()> {
        let resp: ApiResponse<LoginData> = self
            .call(
                self.http.post(self.api("/auth/login")).json(&LoginRequest {
                    username: &self.username,
                    password: &self.password,
                }),
                "login",
            )
            .await?;

        match resp.data {
            Some(data) if resp.code == 200 => {
                *self.token.write().await = data.token;
                tracing::info!(endpoint = %self.endpoint, "Logged in to AList");
                Ok(())
            }
            _ => Err(Error::Storage(format!("AList login rejected: {}", resp.message))),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let builder = self
            .authed(self.http.post(self.api("/fs/mkdir")).json(&PathRequest { path }))
            .await;
        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("AList mkdir request failed: {}", e)))?;

        match resp.status() {
            StatusCode::CONFLICT => Ok(()),
            StatusCode::OK => {
                let body: ApiResponse<serde_json::Value> = resp
                    .json()
                    .await
                    .map_err(|e| Error::Storage(format!("Malformed AList mkdir response: {}", e)))?;
                if body.code == 200 || body.message.to_ascii_lowercase().contains("exist") {
                    Ok(())
                } else {
                    Err(Error::Storage(format!(
                        "AList mkdir {} failed: {}",
                        path, body.message
                    )))
                }
            }
            status => Err(Error::Storage(format!(
                "AList mkdir {} returned {}",
                path, status
            ))),
        }
    }

    async fn upload(&self, path: &str, data: Bytes) -> Result<()> {
        let builder = self
            .authed(
                self.http
                    .put(self.api("/fs/put"))
                    .header("File-Path", encode_path(path))
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(data),
            )
            .await;
        let resp: ApiResponse<serde_json::Value> = self.call(builder, "put").await?;
        if resp.code != 200 {
            return Err(Error::Storage(format!(
                "AList upload {} failed: {}",
                path, resp.message
            )));
        }
        Ok(())
    }

    /// Entries of a directory; `None` when the directory does not exist.
    async fn list_dir(&self, path: &str) -> Result<Option<Vec<FsObject>>> {
        let resp: ApiResponse<ListData> = self
            .post(
                "/fs/list",
                &ListRequest {
                    path,
                    page: 1,
                    per_page: 0,
                    refresh: false,
                },
            )
            .await?;

        if resp.code != 200 {
            if is_not_found(&resp.message) {
                return Ok(None);
            }
            return Err(Error::Storage(format!(
                "AList list {} failed: {}",
                path, resp.message
            )));
        }
        Ok(Some(
            resp.data.and_then(|d| d.content).unwrap_or_default(),
        ))
    }

    /// Direct-link URL for an object.
    pub fn direct_link(&self, hash: &str) -> String {
        format!("{}/d{}", self.endpoint, self.path(&object_key(hash)))
    }
}

#[async_trait]
impl ContentStore for AListStore {
    fn kind(&self) -> &'static str {
        "alist"
    }

    async fn init(&self) -> Result<()> {
        if self.token.read().await.is_empty() {
            self.login().await?;
        }
        self.mkdir(&self.root).await
    }

    async fn check(&self) -> Result<bool> {
        Ok(self.list_dir(&self.root).await?.is_some())
    }

    async fn get(&self, hash: &str) -> Result<Option<Retrieval>> {
        validate_hash(hash)?;
        Ok(Some(Retrieval::Redirect(self.direct_link(hash))))
    }

    async fn put(&self, hash: &str, body: ByteStream) -> Result<()> {
        validate_hash(hash)?;
        let data = collect_stream(body).await?;
        self.mkdir(&self.path(shard(hash))).await?;
        self.upload(&self.path(&object_key(hash)), data).await
    }

    async fn delete(&self, hash: &str) -> Result<()> {
        validate_hash(hash)?;
        let dir = self.path(shard(hash));
        let resp: ApiResponse<serde_json::Value> = self
            .post(
                "/fs/remove",
                &RemoveRequest {
                    dir: &dir,
                    names: vec![hash],
                },
            )
            .await?;

        if resp.code == 200 || is_not_found(&resp.message) {
            Ok(())
        } else {
            Err(Error::Storage(format!(
                "AList remove {} failed: {}",
                hash, resp.message
            )))
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        let path = self.path(&object_key(hash));
        let resp: ApiResponse<FsObject> = self.post("/fs/get", &PathRequest { path: &path }).await?;

        match resp.data {
            Some(obj) if resp.code == 200 => Ok(!obj.is_dir),
            _ if is_not_found(&resp.message) => Ok(false),
            _ => Err(Error::Storage(format!(
                "AList get {} failed: {}",
                path, resp.message
            ))),
        }
    }

    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        let rel = path.trim_matches('/');
        if rel.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(Error::Validation(format!("Illegal file path: {}", path)));
        }
        if let Some((dir, _)) = rel.rsplit_once('/') {
            self.mkdir(&self.path(dir)).await?;
        }
        self.upload(&self.path(rel), content).await
    }

    async fn list_files(&self) -> Result<Vec<StoredFile>> {
        let Some(top) = self.list_dir(&self.root).await? else {
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        for dir in top.iter().filter(|e| e.is_dir && e.name.len() == 2) {
            let Some(children) = self.list_dir(&self.path(&dir.name)).await? else {
                continue;
            };
            for obj in children.iter().filter(|e| !e.is_dir) {
                let key = format!("{}/{}", dir.name, obj.name);
                if let Some(hash) = hash_from_key(&key) {
                    files.push(StoredFile {
                        hash: hash.to_string(),
                        size: obj.size,
                        mtime: obj.mtime(),
                    });
                }
            }
        }

        Ok(files)
    }
}
