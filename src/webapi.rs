//! Asset resolver and store client for the host's Web API.
//!
//! Runtime files live as records in a single table. Resolution is an
//! equality-filtered collection query on the name column; retrieval reads
//! the content column of one record. Neither call is retried.
//!
//! ```text
//! GET {client}/api/data/v9.2/dev_webassemblies?$filter=dev_name eq 'dotnet.js.gz'
//! GET {client}/api/data/v9.2/dev_webassemblies(<id>)/dev_content
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::asset::{ensure_suffix, AssetIdentifier, AssetSource};
use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// `value` envelope returned by both endpoints.
#[derive(Debug, Deserialize)]
struct ODataValue<T> {
    value: T,
}

/// Web API client implementing [`AssetSource`].
#[derive(Clone)]
pub struct WebApiAssets {
    http: reqwest::Client,
    config: Arc<ProxyConfig>,
}

impl WebApiAssets {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: Arc<ProxyConfig>) -> Self {
        Self { http, config }
    }

    fn get(&self, url: &str, accept: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .header("OData-Version", "4.0");
        match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Look up the record identifier for `logical_name`.
    ///
    /// The name is normalized to carry the compressed suffix first.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::NotFound`] when no record matches
    /// - [`ProxyError::Transport`] on network failure, a non-success status,
    ///   or a record without the identifier column
    pub async fn resolve_name(&self, logical_name: &str) -> Result<AssetIdentifier, ProxyError> {
        let name = ensure_suffix(logical_name, &self.config.compressed_suffix);
        let filter = format!("{} eq '{}'", self.config.name_field, name.replace('\'', "''"));
        tracing::debug!("Resolving {name} with filter {filter}");

        let response = self
            .get(&self.config.lookup_url(), "application/json")
            .query(&[("$filter", filter.as_str()), ("$select", self.config.id_field.as_str())])
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Lookup for {name} failed: {e}");
                ProxyError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!("Lookup for {name} returned status {status}");
            return Err(ProxyError::Transport(format!(
                "lookup for '{name}' returned status {status}"
            )));
        }

        let body: ODataValue<Vec<serde_json::Map<String, Value>>> = response.json().await?;
        let Some(entity) = body.value.first() else {
            tracing::error!("No record found with the name {name}");
            return Err(ProxyError::not_found(name));
        };

        entity
            .get(&self.config.id_field)
            .and_then(Value::as_str)
            .map(AssetIdentifier::new)
            .ok_or_else(|| {
                ProxyError::Transport(format!(
                    "record for '{name}' has no '{}' column",
                    self.config.id_field
                ))
            })
    }

    /// Read the base64 payload of one record.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] on network failure, a non-success
    /// status, or a body without a string `value`.
    pub async fn read_content(&self, identifier: &AssetIdentifier) -> Result<String, ProxyError> {
        let url = self.config.content_url(identifier.as_str());
        let response = self
            .get(&url, "application/json;odata=verbose")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!("Content read for record {identifier} returned status {status}");
            return Err(ProxyError::Transport(format!(
                "content read for record {identifier} returned status {status}"
            )));
        }

        let body: ODataValue<String> = response
            .json()
            .await
            .map_err(|e| ProxyError::Transport(format!("unexpected content body for record {identifier}: {e}")))?;
        Ok(body.value)
    }
}

#[async_trait]
impl AssetSource for WebApiAssets {
    async fn resolve(&self, logical_name: &str) -> Result<AssetIdentifier, ProxyError> {
        self.resolve_name(logical_name).await
    }

    async fn fetch_content(&self, identifier: &AssetIdentifier) -> Result<String, ProxyError> {
        self.read_content(identifier).await
    }
}
