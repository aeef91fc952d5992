//! Fetch interceptor.
//!
//! Installed over a [`FetchScope`], it serves every request under the
//! virtualization base (or naming a bare file at the origin root) from the
//! asset store, and hands everything else to the fetch it replaced.
//!
//! Requests flow through the pipeline like this:
//!
//! ```text
//! url ─ classify ─┬─ Virtualized ─ resolve ─ fetch_content ─ decompress ─ (patch) ─ response
//!                 └─ Passthrough ─ original fetch
//! ```

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

use crate::asset::{ensure_suffix, AssetPayload, AssetRequest, AssetSource, MimeType};
use crate::config::ProxyConfig;
use crate::decompress;
use crate::error::ProxyError;
use crate::fetch::{Fetch, FetchRequest, FetchResponse, FetchScope, ResponseBody};
use crate::patcher::Patcher;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Virtualized(AssetRequest),
    Passthrough,
}

#[derive(Default)]
struct InterceptorState {
    original_fetch: Option<Arc<dyn Fetch>>,
    installed: bool,
}

pub struct FetchInterceptor {
    config: Arc<ProxyConfig>,
    source: Arc<dyn AssetSource>,
    patcher: Patcher,
    scope: Arc<FetchScope>,
    state: Mutex<InterceptorState>,
}

impl FetchInterceptor {
    pub fn new(
        config: Arc<ProxyConfig>,
        source: Arc<dyn AssetSource>,
        patcher: Patcher,
        scope: Arc<FetchScope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            source,
            patcher,
            scope,
            state: Mutex::new(InterceptorState::default()),
        })
    }

    pub fn scope(&self) -> &Arc<FetchScope> {
        &self.scope
    }

    pub fn is_installed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .installed
    }

    /// Override both bindings of the scope.
    ///
    /// The fetch bound at the first call is captured as the original. Later
    /// calls while installed change nothing, so the captured original is
    /// never one of our own overrides.
    pub fn install(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.installed {
            tracing::debug!("Fetch interceptor already installed");
            return;
        }
        state.original_fetch = Some(self.scope.global());
        state.installed = true;
        self.scope.bind(Arc::new(InterceptedFetch {
            interceptor: Arc::downgrade(self),
        }));
        tracing::info!("Fetch interceptor installed for {}", self.config.base_url());
    }

    /// Restore the captured original on both bindings.
    ///
    /// Returns `false` when nothing was installed.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.installed {
            return false;
        }
        state.installed = false;
        if let Some(original) = state.original_fetch.take() {
            self.scope.bind(original);
        }
        tracing::info!("Fetch interceptor released");
        true
    }

    fn original(&self) -> Arc<dyn Fetch> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &state.original_fetch {
            Some(original) => original.clone(),
            None => self.scope.global(),
        }
    }

    /// Decide whether `url` is served from the store.
    ///
    /// Virtualized are targets under the base, and targets naming a single
    /// file at the origin root, whether absolute or a bare relative name
    /// such as `dotnet.js`.
    pub fn classify(&self, url: &str) -> Route {
        let url = url.split(['?', '#']).next().unwrap_or_default();
        let base = self.config.base_url();
        let root = self.config.root_url();

        let (rest, is_base) = if let Some(rest) = url.strip_prefix(&base) {
            (rest, true)
        } else if let Some(rest) = url.strip_prefix(&root) {
            (rest, false)
        } else if url::Url::parse(url).is_err() {
            (url, false)
        } else {
            return Route::Passthrough;
        };

        let is_root_relative = !rest.contains('/');
        if rest.is_empty() || (!is_base && !is_root_relative) {
            return Route::Passthrough;
        }

        Route::Virtualized(AssetRequest {
            logical_path: rest.to_string(),
            is_root_relative,
        })
    }

    fn is_bootstrap(&self, name: &str) -> bool {
        let suffix = &self.config.compressed_suffix;
        ensure_suffix(name, suffix) == ensure_suffix(&self.config.bootstrap_name, suffix)
    }

    /// Resolve, retrieve, decompress and, for scripts, patch one asset.
    ///
    /// # Errors
    ///
    /// Propagates the failure of whichever stage broke. The bootstrap module
    /// additionally fails with [`ProxyError::PatchMismatch`].
    pub async fn serve(&self, request: &AssetRequest) -> Result<AssetPayload, ProxyError> {
        let suffix = &self.config.compressed_suffix;
        let name = ensure_suffix(&request.logical_path, suffix);
        let mime_type = MimeType::infer(&name, suffix);

        let identifier = self.source.resolve(&name).await?;
        let payload = self.source.fetch_content(&identifier).await?;

        let body = if mime_type.is_script() {
            let text = decompress::to_text(&payload)?;
            let patched = if self.is_bootstrap(&name) {
                self.patcher.patch_strict(&text)?
            } else {
                self.patcher.patch_lenient(&text)
            };
            ResponseBody::Text(patched)
        } else {
            ResponseBody::Binary(decompress::to_binary(&payload)?)
        };

        tracing::debug!("Served {name} ({}, {} bytes)", mime_type.content_type(), body.len());
        Ok(AssetPayload { mime_type, body })
    }
}

#[async_trait]
impl Fetch for FetchInterceptor {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError> {
        match self.classify(&request.url) {
            Route::Virtualized(asset) => {
                tracing::debug!("Virtualizing {} as {}", request.url, asset.logical_path);
                let payload = self.serve(&asset).await.map_err(|e| {
                    tracing::error!("Failed to serve {}: {e}", request.url);
                    e
                })?;
                Ok(FetchResponse::ok(
                    request.url,
                    payload.mime_type.content_type(),
                    payload.body,
                ))
            }
            Route::Passthrough => self.original().fetch(request).await,
        }
    }
}

/// What the scope holds while installed. Weak, so an interceptor dropped
/// without release does not keep itself alive through the scope.
struct InterceptedFetch {
    interceptor: Weak<FetchInterceptor>,
}

#[async_trait]
impl Fetch for InterceptedFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError> {
        let Some(interceptor) = self.interceptor.upgrade() else {
            return Err(ProxyError::Transport(format!(
                "fetch interceptor dropped before {}",
                request.url
            )));
        };
        interceptor.fetch(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetIdentifier, MemoryAssets};
    use crate::decompress::compress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFetch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetch for CountingFetch {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResponse::ok(
                request.url,
                "text/plain",
                ResponseBody::Text("network".to_string()),
            ))
        }
    }

    const ORIGIN: &str = "https://org.crm.dynamics.com";

    fn assets() -> MemoryAssets {
        let mut assets = MemoryAssets::new(".gz");
        let put = |assets: &mut MemoryAssets, name: &str, id: &str, bytes: &[u8]| {
            assets.insert(name, AssetIdentifier::new(id), compress(bytes));
        };
        put(
            &mut assets,
            "dotnet.js",
            "boot",
            b"const d = globalThis.document;\nconst r = await import(\"./dotnet.runtime.js\");\n",
        );
        put(&mut assets, "dotnet.runtime.js", "rt", b"export const x = await import(\"./x.js\");");
        put(&mut assets, "blazor.boot.json", "cfg", b"{\"mainAssemblyName\":\"App\"}");
        put(&mut assets, "dotnet.native.wasm", "wasm", b"\0asm\x01\0\0\0");
        put(&mut assets, "icudt.dat", "icu", &[1, 2, 3]);
        assets
    }

    fn interceptor_with(source: MemoryAssets) -> (Arc<FetchInterceptor>, Arc<CountingFetch>) {
        let original = Arc::new(CountingFetch::default());
        let scope = Arc::new(FetchScope::new(original.clone()));
        let interceptor = FetchInterceptor::new(
            Arc::new(ProxyConfig::new(ORIGIN)),
            Arc::new(source),
            Patcher::default(),
            scope,
        );
        (interceptor, original)
    }

    #[test]
    fn test_classification() {
        let (interceptor, _) = interceptor_with(MemoryAssets::new(".gz"));
        let virtualized = |url: &str, path: &str, root_relative: bool| {
            assert_eq!(
                interceptor.classify(url),
                Route::Virtualized(AssetRequest {
                    logical_path: path.to_string(),
                    is_root_relative: root_relative,
                }),
                "{url}"
            );
        };

        virtualized(&format!("{ORIGIN}/_framework/dotnet.js"), "dotnet.js", true);
        virtualized(
            &format!("{ORIGIN}/_framework/supportFiles/a.js"),
            "supportFiles/a.js",
            false,
        );
        virtualized(&format!("{ORIGIN}/dotnet.runtime.js"), "dotnet.runtime.js", true);
        virtualized(&format!("{ORIGIN}/_framework/app.wasm?v=1"), "app.wasm", true);
        virtualized("dotnet.js", "dotnet.js", true);
        virtualized("blazor.boot.json?v=2", "blazor.boot.json", true);

        for url in [
            "https://cdn.example.com/_framework/dotnet.js".to_string(),
            format!("{ORIGIN}/api/data/v9.2/dev_webassemblies"),
            format!("{ORIGIN}/"),
            format!("{ORIGIN}/WebResources/app.js"),
            "http://org.crm.dynamics.com/_framework/dotnet.js".to_string(),
            "supportFiles/a.js".to_string(),
            "./dotnet.js".to_string(),
            String::new(),
        ] {
            assert_eq!(interceptor.classify(&url), Route::Passthrough, "{url}");
        }
    }

    #[tokio::test]
    async fn test_served_content_types() {
        let (interceptor, original) = interceptor_with(assets());
        interceptor.install();
        let fetch = interceptor.scope().global();

        for (name, content_type) in [
            ("dotnet.runtime.js", "application/javascript"),
            ("blazor.boot.json", "application/json"),
            ("dotnet.native.wasm", "application/wasm"),
            ("icudt.dat", "application/dat"),
        ] {
            let response = fetch
                .fetch(format!("{ORIGIN}/_framework/{name}").into())
                .await
                .unwrap();
            assert_eq!(response.header("content-type"), Some(content_type), "{name}");
        }
        assert_eq!(original.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bare_name_is_served_from_store() {
        let (interceptor, original) = interceptor_with(assets());
        interceptor.install();

        let response = interceptor
            .scope()
            .global()
            .fetch("dotnet.native.wasm".into())
            .await
            .unwrap();
        assert_eq!(response.header("content-type"), Some("application/wasm"));
        assert_eq!(response.body, ResponseBody::Binary(b"\0asm\x01\0\0\0".to_vec()));
        assert_eq!(original.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scripts_are_patched_and_binaries_are_not() {
        let (interceptor, _) = interceptor_with(assets());
        interceptor.install();
        let fetch = interceptor.scope().global();

        let boot = fetch
            .fetch(format!("{ORIGIN}/_framework/dotnet.js").into())
            .await
            .unwrap();
        match boot.body {
            ResponseBody::Text(text) => {
                assert!(text.contains("globalThis.getDocument()"));
                assert!(text.contains("await globalThis.customImport(\"./dotnet.runtime.js\")"));
            }
            other => panic!("expected text, got {other:?}"),
        }

        let wasm = fetch
            .fetch(format!("{ORIGIN}/_framework/dotnet.native.wasm").into())
            .await
            .unwrap();
        assert_eq!(wasm.body, ResponseBody::Binary(b"\0asm\x01\0\0\0".to_vec()));

        let config = fetch
            .fetch(format!("{ORIGIN}/_framework/blazor.boot.json").into())
            .await
            .unwrap();
        assert_eq!(config.body.as_bytes(), b"{\"mainAssemblyName\":\"App\"}");
    }

    #[tokio::test]
    async fn test_failures_reject_the_fetch() {
        let mut source = assets();
        source.insert("broken.js", AssetIdentifier::new("broken"), "bm90IGd6aXA=".to_string());
        source.insert(
            "dotnet.js",
            AssetIdentifier::new("boot2"),
            compress(b"export const dotnet = {};"),
        );
        let (interceptor, original) = interceptor_with(source);
        interceptor.install();
        let fetch = interceptor.scope().global();

        let missing = fetch.fetch(format!("{ORIGIN}/_framework/missing.js").into()).await;
        assert!(matches!(missing, Err(ProxyError::NotFound { .. })));

        let broken = fetch.fetch(format!("{ORIGIN}/_framework/broken.js").into()).await;
        assert!(matches!(broken, Err(ProxyError::Decode(_))));

        let boot = fetch.fetch(format!("{ORIGIN}/_framework/dotnet.js").into()).await;
        assert!(matches!(boot, Err(ProxyError::PatchMismatch { .. })));

        // Failures never fall back to the network.
        assert_eq!(original.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_install_twice_keeps_first_original() {
        let (interceptor, original) = interceptor_with(assets());
        interceptor.install();
        interceptor.install();
        assert!(interceptor.is_installed());

        let scope = interceptor.scope().clone();
        for fetch in [scope.global(), scope.window()] {
            let response = fetch
                .fetch("https://elsewhere.example.com/data.json".into())
                .await
                .unwrap();
            assert_eq!(response.body, ResponseBody::Text("network".to_string()));
        }
        assert_eq!(original.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_restores_both_bindings_once() {
        let (interceptor, original) = interceptor_with(assets());
        interceptor.install();
        assert!(interceptor.release());
        assert!(!interceptor.release());
        assert!(!interceptor.is_installed());

        // With the original restored, base URLs reach the network again.
        let scope = interceptor.scope().clone();
        let url = format!("{ORIGIN}/_framework/dotnet.js");
        scope.global().fetch(url.as_str().into()).await.unwrap();
        scope.window().fetch(url.as_str().into()).await.unwrap();
        assert_eq!(original.calls.load(Ordering::SeqCst), 2);

        // And it can be installed again.
        interceptor.install();
        let response = scope.global().fetch(url.into()).await.unwrap();
        assert_eq!(response.header("content-type"), Some("application/javascript"));
        assert_eq!(original.calls.load(Ordering::SeqCst), 2);
    }
}
