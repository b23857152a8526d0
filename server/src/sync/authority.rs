//! Authenticated HTTP access to the authority server.

use std::time::Duration;

use reqwest::{Response, StatusCode};

use crate::auth::broker::CredentialBroker;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest slice of an error body kept in logs.
const MAX_LOGGED_BODY: usize = 512;

/// Client for bearer-authenticated GETs against the authority.
///
/// There is no overall request timeout, since file downloads can run long.
/// Instead every read must make progress within `read_timeout`, so a stalled
/// origin fails the request rather than holding its download slot forever.
#[derive(Clone)]
pub struct AuthorityClient {
    http: reqwest::Client,
    base: String,
    broker: CredentialBroker,
}

impl AuthorityClient {
    pub fn new(base_url: &str, broker: CredentialBroker, read_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            broker,
        })
    }

    /// Absolute URL for a path relative to the authority base.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// GET `path` with the current bearer token.
    ///
    /// Any status >= 400 is a transport error; the request line and a
    /// truncated body are logged, the token is not.
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let token = self.broker.acquire_token().await?;
        let url = self.url(path);

        let resp = match self
            .http
            .get(&url)
            .query(query)
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(method = "GET", url = %url, "Authority request failed: {}", e);
                return Err(Error::Transport(format!("GET {} failed: {}", url, e)));
            }
        };

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_LOGGED_BODY).collect();
            tracing::error!(
                method = "GET",
                url = %url,
                status = status.as_u16(),
                body = %body,
                "Authority returned an error status"
            );
            return Err(Error::Transport(format!("GET {} returned {}", url, status)));
        }

        Ok(resp)
    }

    /// Like [`get`](Self::get) but additionally requires exactly `expected`.
    pub async fn get_expecting(
        &self,
        path: &str,
        query: &[(&str, String)],
        expected: &[StatusCode],
    ) -> Result<Response> {
        let resp = self.get(path, query).await?;
        if !expected.contains(&resp.status()) {
            return Err(Error::Transport(format!(
                "GET {} returned unexpected {}",
                self.url(path),
                resp.status()
            )));
        }
        Ok(resp)
    }
}
