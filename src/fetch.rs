//! The fetch primitive and the scope it is bound in.
//!
//! Everything that issues a request on behalf of the loader goes through a
//! [`FetchScope`]. The scope carries two bindings, `global` and `window`,
//! which the interceptor overrides and later restores together.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Options as the loader passes them to `fetch(input, init)`, merged with
/// the fields of a request-object input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Absent means `GET`.
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// A fetch target, normalized from either a bare URL or a request object.
///
/// Passthrough requests are forwarded with every field intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, options: FetchOptions) -> Self {
        Self {
            url: url.into(),
            method: options.method.unwrap_or_else(|| "GET".to_string()),
            headers: options.headers,
            body: options.body,
        }
    }

    /// A plain `GET` with no headers and no body.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, FetchOptions::default())
    }
}

impl From<&str> for FetchRequest {
    fn from(url: &str) -> Self {
        Self::get(url)
    }
}

impl From<String> for FetchRequest {
    fn from(url: String) -> Self {
        Self::get(url)
    }
}

impl From<&url::Url> for FetchRequest {
    fn from(url: &url::Url) -> Self {
        Self::get(url.as_str())
    }
}

/// Response body as the loader will read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Text(String),
    Binary(Vec<u8>),
}

impl ResponseBody {
    pub fn len(&self) -> usize {
        match self {
            ResponseBody::Text(text) => text.len(),
            ResponseBody::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ResponseBody::Text(text) => text.as_bytes(),
            ResponseBody::Binary(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl FetchResponse {
    /// A `200 OK` response carrying a single `content-type` header.
    pub fn ok(url: impl Into<String>, content_type: &str, body: ResponseBody) -> Self {
        Self {
            url: url.into(),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body,
        }
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait Fetch: Send + Sync {
    /// Failures reject the fetch; a non-success status is still a response.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError>;
}

/// Plain network fetch. This is what the interceptor captures as the original.
#[derive(Debug, Clone, Default)]
pub struct NetworkFetch {
    http: reqwest::Client,
}

impl NetworkFetch {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Fetch for NetworkFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError> {
        let FetchRequest {
            url,
            method,
            headers,
            body,
        } = request;
        tracing::debug!("Network fetch {method} {url}");

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::Transport(format!("invalid method '{method}': {e}")))?;
        let mut builder = self.http.request(method, &url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!("Fetch of {url} failed: {e}");
            ProxyError::from(e)
        })?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let url = response.url().to_string();
        let bytes = response.bytes().await?;

        Ok(FetchResponse {
            url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: ResponseBody::Binary(bytes.to_vec()),
        })
    }
}

/// The two bindings a fetch override is installed on.
pub struct FetchScope {
    global: RwLock<Arc<dyn Fetch>>,
    window: RwLock<Arc<dyn Fetch>>,
}

impl FetchScope {
    pub fn new(original: Arc<dyn Fetch>) -> Self {
        Self {
            global: RwLock::new(original.clone()),
            window: RwLock::new(original),
        }
    }

    /// Scope bound to a default [`NetworkFetch`].
    pub fn network() -> Self {
        Self::new(Arc::new(NetworkFetch::default()))
    }

    pub fn global(&self) -> Arc<dyn Fetch> {
        self.global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn window(&self) -> Arc<dyn Fetch> {
        self.window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Point both bindings at `fetch`.
    pub fn bind(&self, fetch: Arc<dyn Fetch>) {
        *self.global.write().unwrap_or_else(PoisonError::into_inner) = fetch.clone();
        *self.window.write().unwrap_or_else(PoisonError::into_inner) = fetch;
    }
}
