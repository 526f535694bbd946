//! The upstream content API.

use crate::error::{Result, TrackerError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

/// Base URL of the public content API.
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.mangadex.org";

/// Authenticated JSON `GET`s against the content API.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Fetch `path` and return the decoded body.
    ///
    /// Error envelopes (`{"result": "error", ...}`) are returned as bodies,
    /// not as errors; only transport failures and undecodable responses fail.
    async fn get_json(&self, path: &str, token: Option<&str>) -> Result<Value>;
}

/// [`UpstreamApi`] over HTTP.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_URL)
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn get_json(&self, path: &str, token: Option<&str>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "fetching");

        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        match response.json::<Value>().await {
            Ok(body) => Ok(body),
            Err(_) if !status.is_success() => Err(TrackerError::Remote {
                status: status.as_u16(),
                url,
            }),
            Err(e) => Err(e.into()),
        }
    }
}
