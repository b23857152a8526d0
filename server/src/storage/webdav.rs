//! WebDAV backend.
//!
//! Objects live at `{endpoint}{path}/{shard}/{hash}` on the share; downloads
//! are answered with a redirect to that URL. Listing walks the two-level tree
//! with `PROPFIND Depth: 1`. A `423 Locked` answer is retried after a cooldown,
//! up to [`MAX_LOCK_ATTEMPTS`] times.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use crate::config::WebDavConfig;
use crate::error::{Error, Result};
use crate::models::StoredFile;
use crate::storage::{
    collect_stream, hash_from_key, object_key, shard, validate_hash, ByteStream, ContentStore,
    Retrieval,
};

pub const MAX_LOCK_ATTEMPTS: u32 = 5;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:getcontentlength/><D:getlastmodified/></D:prop></D:propfind>"#;

pub struct WebDavStore {
    http: reqwest::Client,
    endpoint: String,
    /// Root collection, `""` or `/a/b` (leading slash, no trailing slash).
    root: String,
    username: String,
    password: String,
    lock_cooldown: Duration,
    propfind: Method,
    mkcol: Method,
}

/// One `<response>` of a multistatus body.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DavEntry {
    pub href: String,
    pub is_collection: bool,
    pub size: i64,
    pub mtime: i64,
}

impl DavEntry {
    /// Last path segment of the href.
    pub fn name(&self) -> &str {
        self.href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

impl WebDavStore {
    pub fn new(config: &WebDavConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(|e| Error::Storage(format!("Failed to build WebDAV client: {}", e)))?;

        let root = config.path.trim_matches('/');
        let root = if root.is_empty() {
            String::new()
        } else {
            format!("/{}", root)
        };

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            root,
            username: config.username.clone(),
            password: config.password.clone(),
            lock_cooldown: Duration::from_secs(config.lock_cooldown_secs),
            propfind: Method::from_bytes(b"PROPFIND")
                .map_err(|e| Error::Storage(format!("Invalid method: {}", e)))?,
            mkcol: Method::from_bytes(b"MKCOL")
                .map_err(|e| Error::Storage(format!("Invalid method: {}", e)))?,
        })
    }

    /// Absolute URL of `rel` under the root collection.
    fn url(&self, rel: &str) -> String {
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            format!("{}{}/", self.endpoint, self.root)
        } else {
            format!("{}{}/{}", self.endpoint, self.root, rel)
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        if self.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// Send, waiting out `423 Locked` answers.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let resp = build()
                .send()
                .await
                .map_err(|e| Error::Transport(format!("WebDAV request failed: {}", e)))?;

            if resp.status() != StatusCode::LOCKED {
                return Ok(resp);
            }
            if attempt < MAX_LOCK_ATTEMPTS {
                tracing::warn!(
                    url = %resp.url(),
                    attempt,
                    "WebDAV resource locked, retrying in {:?}",
                    self.lock_cooldown
                );
                tokio::time::sleep(self.lock_cooldown).await;
            }
        }

        Err(Error::Storage(format!(
            "WebDAV resource still locked after {} attempts",
            MAX_LOCK_ATTEMPTS
        )))
    }

    async fn propfind(&self, rel: &str, depth: u8) -> Result<Option<Vec<DavEntry>>> {
        let url = self.url(rel);
        let resp = self
            .send(|| {
                self.request(self.propfind.clone(), &url)
                    .header("Depth", depth.to_string())
                    .header(reqwest::header::CONTENT_TYPE, "application/xml")
                    .body(PROPFIND_BODY)
            })
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::MULTI_STATUS => {
                let text = resp
                    .text()
                    .await
                    .map_err(|e| Error::Transport(format!("Failed to read PROPFIND body: {}", e)))?;
                parse_multistatus(&text).map(Some)
            }
            status => Err(Error::Storage(format!("PROPFIND {} returned {}", url, status))),
        }
    }

    /// MKCOL one collection. Existing collections are fine.
    async fn mkcol(&self, url: &str) -> Result<()> {
        let resp = self.send(|| self.request(self.mkcol.clone(), url)).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(Error::Storage(format!("MKCOL {} returned {}", url, status))),
        }
    }

    async fn upload(&self, rel: &str, data: Bytes) -> Result<()> {
        let url = self.url(rel);
        let resp = self
            .send(|| self.request(Method::PUT, &url).body(data.clone()))
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "PUT {} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Path of `href` with any scheme and authority stripped.
    fn href_path(href: &str) -> &str {
        match href.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("/", |i| &rest[i..]),
            None => href,
        }
    }
}

#[async_trait]
impl ContentStore for WebDavStore {
    fn kind(&self) -> &'static str {
        "webdav"
    }

    async fn init(&self) -> Result<()> {
        let mut url = self.endpoint.clone();
        for segment in self.root.split('/').filter(|s| !s.is_empty()) {
            url.push('/');
            url.push_str(segment);
            self.mkcol(&format!("{}/", url)).await?;
        }
        Ok(())
    }

    async fn check(&self) -> Result<bool> {
        Ok(self.propfind("", 0).await?.is_some())
    }

    async fn get(&self, hash: &str) -> Result<Option<Retrieval>> {
        validate_hash(hash)?;
        Ok(Some(Retrieval::Redirect(self.url(&object_key(hash)))))
    }

    async fn put(&self, hash: &str, body: ByteStream) -> Result<()> {
        validate_hash(hash)?;
        // Buffered so a locked upload can be replayed.
        let data = collect_stream(body).await?;
        self.mkcol(&format!("{}/", self.url(shard(hash)))).await?;
        self.upload(&object_key(hash), data).await
    }

    async fn delete(&self, hash: &str) -> Result<()> {
        validate_hash(hash)?;
        let url = self.url(&object_key(hash));
        let resp = self.send(|| self.request(Method::DELETE, &url)).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::Storage(format!("DELETE {} returned {}", url, status))),
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        Ok(self
            .propfind(&object_key(hash), 0)
            .await?
            .is_some_and(|entries| entries.iter().any(|e| !e.is_collection)))
    }

    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        let rel = path.trim_matches('/');
        if rel.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(Error::Validation(format!("Illegal file path: {}", path)));
        }

        let mut parent = String::new();
        if let Some((dirs, _)) = rel.rsplit_once('/') {
            for segment in dirs.split('/') {
                parent.push_str(segment);
                parent.push('/');
                self.mkcol(&self.url(&parent)).await?;
            }
        }
        self.upload(rel, content).await
    }

    async fn list_files(&self) -> Result<Vec<StoredFile>> {
        let Some(top) = self.propfind("", 1).await? else {
            return Ok(Vec::new());
        };
        let root_path = format!("{}/", self.root);

        let mut files = Vec::new();
        for dir in top.iter().filter(|e| e.is_collection) {
            if Self::href_path(&dir.href).trim_end_matches('/') == root_path.trim_end_matches('/') {
                continue;
            }
            let shard_name = dir.name();
            if shard_name.len() != 2 {
                continue;
            }

            let Some(children) = self.propfind(&format!("{}/", shard_name), 1).await? else {
                continue;
            };
            for entry in children.iter().filter(|e| !e.is_collection) {
                let key = format!("{}/{}", shard_name, entry.name());
                if let Some(hash) = hash_from_key(&key) {
                    files.push(StoredFile {
                        hash: hash.to_string(),
                        size: entry.size,
                        mtime: entry.mtime,
                    });
                }
            }
        }

        Ok(files)
    }
}

#[derive(Clone, Copy)]
enum Field {
    Href,
    Length,
    Modified,
}

/// Parse a `207 Multi-Status` body. Namespace prefixes are ignored.
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"href" => field = Some(Field::Href),
                b"getcontentlength" => field = Some(Field::Length),
                b"getlastmodified" => field = Some(Field::Modified),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(f), Some(entry)) = (field, current.as_mut()) {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Decode(format!("Bad multistatus text: {}", e)))?;
                    match f {
                        Field::Href => entry.href = text.into_owned(),
                        Field::Length => entry.size = text.trim().parse().unwrap_or(0),
                        Field::Modified => {
                            entry.mtime = chrono::DateTime::parse_from_rfc2822(text.trim())
                                .map(|t| t.timestamp())
                                .unwrap_or(0)
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"href" | b"getcontentlength" | b"getlastmodified" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::Decode(format!(
                    "Malformed multistatus at {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(entries)
}
