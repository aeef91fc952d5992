//! Deployment configuration.
//!
//! Defaults describe the stock deployment: runtime files published as
//! gzip records in the `dev_webassemblies` table and requested by the
//! loader under `<origin>/_framework/`.

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Where the loader executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Run the loader in an isolate on the caller's thread.
    #[default]
    Inline,
    /// Run the loader in an isolate on a dedicated worker thread and proxy
    /// its fetches back over messages.
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Base client URL of the host environment, used to build Web API endpoints.
    pub client_url: String,
    /// Externally visible origin the loader believes it is served from.
    /// Falls back to `client_url` when unset.
    pub origin: Option<String>,
    /// Virtualization base path, relative to the origin.
    pub base_path: String,
    pub api_version: String,
    /// Entity set holding one record per runtime file.
    pub entity_set: String,
    /// Column carrying the logical file name.
    pub name_field: String,
    /// Column carrying the record identifier.
    pub id_field: String,
    /// Column carrying the base64 gzip payload.
    pub content_field: String,
    pub compressed_suffix: String,
    /// Logical name of the bootstrap module.
    pub bootstrap_name: String,
    /// Logical name of the boot configuration handed to `withConfigSrc`.
    pub boot_config: String,
    /// Export path invoked by the reset button.
    pub reset_export: String,
    /// Export path invoked by the pause button; returns the running flag.
    pub toggle_export: String,
    /// Element the loader writes its output into.
    pub output_selector: String,
    /// Bearer token supplied by the host session, if any.
    pub access_token: Option<String>,
    pub mode: ControlMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            client_url: "http://localhost".to_string(),
            origin: None,
            base_path: "_framework/".to_string(),
            api_version: "v9.2".to_string(),
            entity_set: "dev_webassemblies".to_string(),
            name_field: "dev_name".to_string(),
            id_field: "dev_webassemblyid".to_string(),
            content_field: "dev_content".to_string(),
            compressed_suffix: ".gz".to_string(),
            bootstrap_name: "dotnet.js".to_string(),
            boot_config: "blazor.boot.json".to_string(),
            reset_export: "StopwatchSample.Reset".to_string(),
            toggle_export: "StopwatchSample.Toggle".to_string(),
            output_selector: "#time".to_string(),
            access_token: None,
            mode: ControlMode::Inline,
        }
    }
}

impl ProxyConfig {
    pub fn new(client_url: impl Into<String>) -> Self {
        Self {
            client_url: client_url.into(),
            ..Default::default()
        }
    }

    /// Reject configurations that cannot produce usable endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] when a URL does not parse or a
    /// required name is empty.
    pub fn validate(&self) -> Result<(), ProxyError> {
        for (label, value) in [("client_url", self.client_url.as_str()), ("origin", self.origin())] {
            let parsed = url::Url::parse(value)
                .map_err(|e| ProxyError::Config(format!("{label} '{value}' is not a valid URL: {e}")))?;
            if parsed.host_str().is_none() {
                return Err(ProxyError::Config(format!("{label} '{value}' has no host")));
            }
        }
        if !self.base_path.ends_with('/') || self.base_path.starts_with('/') {
            return Err(ProxyError::Config(format!(
                "base_path '{}' must be relative and end with '/'",
                self.base_path
            )));
        }
        if self.compressed_suffix.is_empty() {
            return Err(ProxyError::Config("compressed_suffix must not be empty".to_string()));
        }
        if self.bootstrap_name.is_empty() {
            return Err(ProxyError::Config("bootstrap_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Origin without a trailing slash.
    pub fn origin(&self) -> &str {
        self.origin
            .as_deref()
            .unwrap_or(&self.client_url)
            .trim_end_matches('/')
    }

    /// `host[:port]` of the origin, as exposed through `location.host`.
    pub fn host(&self) -> String {
        url::Url::parse(self.origin())
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h.to_string(),
                })
            })
            .unwrap_or_default()
    }

    /// The virtualization base minus its trailing segment.
    pub fn root_url(&self) -> String {
        format!("{}/", self.origin())
    }

    /// Every request under this prefix is virtualized.
    pub fn base_url(&self) -> String {
        format!("{}{}", self.root_url(), self.base_path)
    }

    pub fn bootstrap_url(&self) -> String {
        format!("{}{}", self.base_url(), self.bootstrap_name)
    }

    pub fn boot_config_url(&self) -> String {
        format!("{}{}", self.base_url(), self.boot_config)
    }

    fn api_root(&self) -> String {
        format!(
            "{}/api/data/{}",
            self.client_url.trim_end_matches('/'),
            self.api_version
        )
    }

    /// Collection endpoint queried by the resolver.
    pub fn lookup_url(&self) -> String {
        format!("{}/{}", self.api_root(), self.entity_set)
    }

    /// Per-record content endpoint: `.../<collection>(<id>)/<content-field>`.
    pub fn content_url(&self, identifier: &str) -> String {
        format!(
            "{}/{}({identifier})/{}",
            self.api_root(),
            self.entity_set,
            self.content_field
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_urls() {
        let config = ProxyConfig::new("https://org.crm.dynamics.com/");
        assert_eq!(config.root_url(), "https://org.crm.dynamics.com/");
        assert_eq!(config.base_url(), "https://org.crm.dynamics.com/_framework/");
        assert_eq!(
            config.bootstrap_url(),
            "https://org.crm.dynamics.com/_framework/dotnet.js"
        );
        assert_eq!(
            config.lookup_url(),
            "https://org.crm.dynamics.com/api/data/v9.2/dev_webassemblies"
        );
        assert_eq!(
            config.content_url("abc-123"),
            "https://org.crm.dynamics.com/api/data/v9.2/dev_webassemblies(abc-123)/dev_content"
        );
    }

    #[test]
    fn test_origin_override() {
        let config = ProxyConfig {
            origin: Some("http://127.0.0.1:8080".to_string()),
            ..ProxyConfig::new("https://org.crm.dynamics.com")
        };
        assert_eq!(config.base_url(), "http://127.0.0.1:8080/_framework/");
        assert_eq!(config.host(), "127.0.0.1:8080");
        assert!(config.content_url("x").starts_with("https://org.crm.dynamics.com/"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ProxyConfig::new("not a url").validate().is_err());

        let config = ProxyConfig {
            base_path: "/_framework".to_string(),
            ..ProxyConfig::new("https://example.com")
        };
        assert!(config.validate().is_err());

        assert!(ProxyConfig::new("https://example.com").validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"client_url":"https://example.com","mode":"worker"}"#).unwrap();
        assert_eq!(config.mode, ControlMode::Worker);
        assert_eq!(config.entity_set, "dev_webassemblies");
        assert_eq!(config.compressed_suffix, ".gz");
    }
}
