//! Asset model and the seam to the remote record store.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::ProxyError;
use crate::fetch::ResponseBody;

/// A virtualized request, derived from the URL the loader asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    /// File name with the virtualization base stripped.
    pub logical_path: String,
    /// True when nothing but a bare file name remained after stripping.
    pub is_root_relative: bool,
}

/// Opaque record key returned by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetIdentifier(String);

impl AssetIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content family, inferred from the compressed file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    Js,
    Json,
    Wasm,
    Dat,
}

impl MimeType {
    /// Infer the family of `name` once `suffix` is removed. Unknown
    /// extensions are treated as script, like the stock deployment does.
    pub fn infer(name: &str, suffix: &str) -> Self {
        let stem = name.strip_suffix(suffix).unwrap_or(name);
        if stem.ends_with(".json") {
            MimeType::Json
        } else if stem.ends_with(".wasm") {
            MimeType::Wasm
        } else if stem.ends_with(".dat") {
            MimeType::Dat
        } else {
            MimeType::Js
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            MimeType::Js => "application/javascript",
            MimeType::Json => "application/json",
            MimeType::Wasm => "application/wasm",
            MimeType::Dat => "application/dat",
        }
    }

    /// Scripts are decoded as text and patched; everything else stays binary.
    pub fn is_script(self) -> bool {
        matches!(self, MimeType::Js)
    }
}

/// Decompressed, typed content ready to satisfy a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPayload {
    pub mime_type: MimeType,
    pub body: ResponseBody,
}

/// Append the compressed suffix unless it is already present.
pub fn ensure_suffix(name: &str, suffix: &str) -> String {
    if name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

/// Remote store holding one compressed record per runtime file.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Map a logical file name to its record identifier.
    async fn resolve(&self, logical_name: &str) -> Result<AssetIdentifier, ProxyError>;

    /// Retrieve the base64 gzip payload stored under `identifier`.
    async fn fetch_content(&self, identifier: &AssetIdentifier) -> Result<String, ProxyError>;
}

/// In-memory asset source, keyed by compressed file name.
///
/// Used for offline runs against a directory of `.gz` files and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryAssets {
    suffix: String,
    names: HashMap<String, AssetIdentifier>,
    payloads: HashMap<AssetIdentifier, String>,
}

impl MemoryAssets {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            ..Default::default()
        }
    }

    /// Register a base64 payload under `name` with an explicit identifier.
    pub fn insert(&mut self, name: &str, identifier: AssetIdentifier, base64_payload: String) {
        let name = ensure_suffix(name, &self.suffix);
        self.payloads.insert(identifier.clone(), base64_payload);
        self.names.insert(name, identifier);
    }

    /// Load every `*<suffix>` file in `dir`. The file name doubles as identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] when the directory cannot be read.
    pub fn load_dir(dir: &Path, suffix: &str) -> Result<Self, ProxyError> {
        let mut assets = Self::new(suffix);
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ProxyError::Transport(format!("cannot read {}: {e}", dir.display())))?;
        for entry in entries {
            let path = entry
                .map_err(|e| ProxyError::Transport(format!("cannot read {}: {e}", dir.display())))?
                .path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(suffix) {
                continue;
            }
            let bytes = std::fs::read(&path)
                .map_err(|e| ProxyError::Transport(format!("cannot read {}: {e}", path.display())))?;
            let name = name.to_string();
            assets.insert(&name, AssetIdentifier::new(name.clone()), BASE64.encode(bytes));
        }
        tracing::info!("Loaded {} assets from {}", assets.len(), dir.display());
        Ok(assets)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[async_trait]
impl AssetSource for MemoryAssets {
    async fn resolve(&self, logical_name: &str) -> Result<AssetIdentifier, ProxyError> {
        let name = ensure_suffix(logical_name, &self.suffix);
        self.names.get(&name).cloned().ok_or_else(|| {
            tracing::error!("No record found with the name {name}");
            ProxyError::not_found(name)
        })
    }

    async fn fetch_content(&self, identifier: &AssetIdentifier) -> Result<String, ProxyError> {
        self.payloads
            .get(identifier)
            .cloned()
            .ok_or_else(|| ProxyError::Transport(format!("no content stored for record {identifier}")))
    }
}
