//! LoaderHost - the isolate the WebAssembly loader runs in.
//!
//! The host wraps a `JsRuntime` with the loader's globals installed and a
//! module loader that only serves modules registered by `customImport`.
//! How fetches leave the isolate and where UI callbacks go are the two
//! seams, [`FetchTransport`] and [`HostEvents`]:
//!
//! - inline mode fetches through the [`FetchScope`] directly and writes to
//!   the control's surface
//! - worker mode posts both over the bridge to the main context

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use deno_core::{
    extension, v8, JsRuntime, ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode,
    ModuleSpecifier, ModuleType, PollEventLoopOptions, RequestedModuleType, ResolutionKind,
    RuntimeOptions,
};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bootstrap::{driver_script, BOOTSTRAP_JS, EXPORTS_GLOBAL};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fetch::{FetchRequest, FetchResponse, FetchScope};
use crate::ops::{
    op_document, op_exports_ready, op_fetch, op_get_time_ms, op_log, op_parse_url,
    op_register_module, op_report_error, op_rewrite_imports, op_set_inner_text, op_sleep,
    DocumentInfo, HostContext, LogEntry, LogStorage, ModuleRegistry,
};
use crate::patcher::Patcher;

/// How a fetch issued inside the isolate is carried out.
#[async_trait(?Send)]
pub trait FetchTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError>;
}

/// Fetch through the scope on the current thread.
pub struct DirectTransport {
    scope: Arc<FetchScope>,
}

impl DirectTransport {
    pub fn new(scope: Arc<FetchScope>) -> Self {
        Self { scope }
    }
}

#[async_trait(?Send)]
impl FetchTransport for DirectTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError> {
        self.scope.global().fetch(request).await
    }
}

/// Callbacks the loader triggers.
pub trait HostEvents {
    fn set_inner_text(&self, selector: &str, text: &str);
    fn exports_ready(&self);
    fn report_error(&self, message: &str);
}

/// Forwards loader callbacks to [`HostEvents`] and settles a pending start.
pub struct HostSignals {
    events: Rc<dyn HostEvents>,
    ready: RefCell<Option<oneshot::Sender<Result<(), String>>>>,
}

impl HostSignals {
    fn new(events: Rc<dyn HostEvents>) -> Self {
        Self {
            events,
            ready: RefCell::new(None),
        }
    }

    fn arm(&self) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.ready.replace(Some(tx));
        rx
    }

    fn settle(&self, outcome: Result<(), String>) {
        if let Some(tx) = self.ready.borrow_mut().take() {
            let _ = tx.send(outcome);
        }
    }

    pub fn set_inner_text(&self, selector: &str, text: &str) {
        self.events.set_inner_text(selector, text);
    }

    pub fn exports_ready(&self) {
        tracing::info!("Loader exports ready");
        self.settle(Ok(()));
        self.events.exports_ready();
    }

    pub fn report_error(&self, message: &str) {
        tracing::error!("Loader failed: {message}");
        self.settle(Err(message.to_string()));
        self.events.report_error(message);
    }
}

/// Serves `blob:` modules registered by `customImport`, nothing else.
struct BlobModuleLoader {
    modules: ModuleRegistry,
}

impl ModuleLoader for BlobModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, anyhow::Error> {
        if specifier.starts_with("blob:") {
            return Ok(ModuleSpecifier::parse(specifier)?);
        }
        Ok(deno_core::resolve_import(specifier, referrer)?)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let code = self.modules.borrow_mut().remove(module_specifier.as_str());
        let result = match code {
            Some(code) => Ok(ModuleSource::new(
                ModuleType::JavaScript,
                ModuleSourceCode::String(code.into()),
                module_specifier,
                None,
            )),
            None => Err(anyhow!(
                "Module {module_specifier} is not registered; load it through customImport"
            )),
        };
        ModuleLoadResponse::Sync(result)
    }
}

extension!(
    wasm_relay_host,
    ops = [
        op_log,
        op_get_time_ms,
        op_sleep,
        op_parse_url,
        op_fetch,
        op_document,
        op_register_module,
        op_rewrite_imports,
        op_set_inner_text,
        op_exports_ready,
        op_report_error,
    ],
    options = {
        log_storage: LogStorage,
        context: HostContext,
    },
    state = |state, options| {
        state.put::<LogStorage>(options.log_storage);
        state.put::<HostContext>(options.context);
    }
);

pub struct HostOptions {
    pub config: Arc<ProxyConfig>,
    pub patcher: Patcher,
    pub transport: Rc<dyn FetchTransport>,
    pub events: Rc<dyn HostEvents>,
}

pub struct LoaderHost {
    /// The underlying V8 runtime
    runtime: JsRuntime,
    /// Shared storage for captured console output
    log_storage: LogStorage,
    signals: Rc<HostSignals>,
    config: Arc<ProxyConfig>,
    pending_ready: Option<oneshot::Receiver<Result<(), String>>>,
}

impl LoaderHost {
    /// Create a fresh isolate with the loader globals installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap JavaScript fails to execute.
    pub fn new(options: HostOptions) -> Result<Self> {
        let log_storage: LogStorage = Rc::new(RefCell::new(Vec::new()));
        let modules: ModuleRegistry = Rc::new(RefCell::new(HashMap::new()));
        let signals = Rc::new(HostSignals::new(options.events));

        let context = HostContext {
            transport: options.transport,
            signals: signals.clone(),
            modules: modules.clone(),
            patcher: Rc::new(options.patcher),
            document: DocumentInfo::from_config(&options.config),
        };

        let runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(BlobModuleLoader { modules })),
            extensions: vec![wasm_relay_host::init_ops(log_storage.clone(), context)],
            ..Default::default()
        });

        let mut host = Self {
            runtime,
            log_storage,
            signals,
            config: options.config,
            pending_ready: None,
        };
        host.bootstrap()?;
        Ok(host)
    }

    fn bootstrap(&mut self) -> Result<()> {
        self.runtime
            .execute_script("[wasm-relay:bootstrap]", BOOTSTRAP_JS)
            .map_err(|e| anyhow!("Bootstrap failed: {}", e))?;
        Ok(())
    }

    /// Kick off the loader without waiting for it.
    ///
    /// Runs the driver script, which imports the bootstrap module as the
    /// interceptor served it, builds the runtime against the boot config,
    /// wires `setInnerText` into the loader's module imports, publishes its
    /// assembly exports and then calls `runMain`. Nothing happens until the
    /// event loop is driven; readiness and failure arrive through
    /// [`HostEvents`] and settle a later [`Self::wait_ready`].
    ///
    /// # Arguments
    /// * `bootstrap_url` - Absolute URL of the bootstrap module, normally
    ///   under the virtualization base
    ///
    /// # Errors
    ///
    /// Returns an error if the driver script itself fails to execute.
    /// Failures while loading are reported asynchronously instead.
    pub fn begin(&mut self, bootstrap_url: &str) -> Result<()> {
        tracing::info!("Starting loader from {bootstrap_url}");
        self.pending_ready = Some(self.signals.arm());
        let driver = driver_script(bootstrap_url, &self.config.boot_config_url());
        self.runtime
            .execute_script("[wasm-relay:driver]", driver)
            .map_err(|e| anyhow!("Driver failed: {}", e))?;
        Ok(())
    }

    /// Start the loader and drive it until its exports are ready.
    pub async fn start(&mut self, bootstrap_url: &str) -> Result<()> {
        self.begin(bootstrap_url)?;
        self.wait_ready().await
    }

    /// Drive the event loop until the loader started by [`Self::begin`]
    /// reports readiness or failure.
    pub async fn wait_ready(&mut self) -> Result<()> {
        let Some(mut ready) = self.pending_ready.take() else {
            bail!("Loader has not been started");
        };

        tokio::select! {
            outcome = &mut ready => return settle(outcome.ok()),
            result = self.runtime.run_event_loop(PollEventLoopOptions::default()) => {
                result.map_err(|e| anyhow!("Event loop error: {}", e))?;
            }
        }
        settle(ready.try_recv().ok())
    }

    /// Call a zero-argument export such as `StopwatchSample.Reset` and
    /// return its (awaited) result.
    pub async fn invoke(&mut self, export_path: &str) -> Result<Option<Value>> {
        let path = Value::from(export_path);
        let code = format!(
            r#"
            const target = {path}
                .split('.')
                .reduce((scope, key) => (scope == null ? undefined : scope[key]), globalThis.{EXPORTS_GLOBAL});
            if (typeof target !== 'function') {{
                throw new Error(`Export ${{{path}}} is not callable`);
            }}
            return await target();
            "#
        );
        self.evaluate(&code)
            .await
            .map_err(|e| anyhow!("Invoking {export_path} failed: {}", e))
    }

    /// Execute JavaScript and return its JSON-convertible result.
    ///
    /// The code runs inside an async function body; use `return` to
    /// produce a value.
    pub async fn evaluate(&mut self, code: &str) -> Result<Option<Value>> {
        let wrapped_code = format!(
            r#"
            (async () => {{
                {code}
            }})()
            "#
        );

        let promise = self
            .runtime
            .execute_script("[wasm-relay:eval]", wrapped_code)
            .map_err(|e| anyhow!("Script execution failed: {}", e))?;

        let resolved = self
            .runtime
            .resolve_value(promise)
            .await
            .map_err(|e| anyhow!("Event loop error: {}", e))?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, resolved);
        if local.is_undefined() || local.is_null() {
            return Ok(None);
        }
        let json_str: Option<String> = v8::json::stringify(scope, local)
            .map(|s: v8::Local<v8::String>| s.to_rust_string_lossy(scope));
        Ok(json_str.and_then(|s: String| serde_json::from_str(&s).ok()))
    }

    /// Drive timers and in-flight fetches until nothing is pending.
    pub async fn run_event_loop(&mut self) -> Result<()> {
        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(|e| anyhow!("Event loop error: {}", e))
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.log_storage.borrow().clone()
    }
}

fn settle(outcome: Option<Result<(), String>>) -> Result<()> {
    match outcome {
        Some(Ok(())) => Ok(()),
        Some(Err(message)) => Err(anyhow!("Loader failed: {message}")),
        None => bail!("Loader stopped without reporting readiness"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::asset::{AssetIdentifier, MemoryAssets};
    use crate::decompress::compress;
    use crate::interceptor::FetchInterceptor;
    use crate::patcher::OptOutScope;

    pub(crate) const ORIGIN: &str = "https://org.crm.dynamics.com";

    /// Stand-in for `dotnet.js`: reads the document, imports its runtime
    /// with a native dynamic import and exposes the builder API.
    pub(crate) const FAKE_LOADER: &str = r##"
const base = globalThis.document.baseURI;
const runtime = await import("./dotnet.runtime.js");
const imports = {};

const builder = {
  withConfigSrc(src) { builder.configSrc = src; return builder; },
  withApplicationArguments(...args) { builder.args = args; return builder; },
  async create() {
    const config = await (await fetch(builder.configSrc)).json();
    const wasm = await fetch(new URL("dotnet.native.wasm", base));
    const bytes = new Uint8Array(await wasm.arrayBuffer());
    return {
      setModuleImports(name, value) { imports[name] = value; },
      getConfig() { return config; },
      async getAssemblyExports(name) { return runtime.exportsFor(name, () => imports["main.js"].dom); },
      async runMain() {
        imports["main.js"].dom.setInnerText("#time", `${config.mainAssemblyName}:${bytes.length}:${builder.args.join(",")}`);
        return 0;
      },
    };
  },
};

export const dotnet = builder;
"##;

    pub(crate) const FAKE_RUNTIME: &str = r##"
const helpers = await import("./dotnet.helpers.js");

export function exportsFor(name, dom) {
  let running = true;
  return {
    StopwatchSample: {
      Reset() { dom().setInnerText("#time", helpers.format(0)); },
      Toggle() { running = !running; return running; },
    },
  };
}
"##;

    pub(crate) const FAKE_HELPERS: &str = r#"export const format = (n) => "00:00:0" + n;"#;

    pub(crate) fn fake_assets() -> MemoryAssets {
        let mut assets = MemoryAssets::new(".gz");
        for (name, body) in [
            ("dotnet.js", FAKE_LOADER.as_bytes()),
            ("dotnet.runtime.js", FAKE_RUNTIME.as_bytes()),
            ("dotnet.helpers.js", FAKE_HELPERS.as_bytes()),
            ("blazor.boot.json", br#"{"mainAssemblyName":"StopwatchSample"}"#.as_slice()),
            ("dotnet.native.wasm", b"\0asm\x01\0\0\0".as_slice()),
        ] {
            assets.insert(name, AssetIdentifier::new(name), compress(body));
        }
        assets
    }

    #[derive(Default)]
    struct RecordingEvents {
        texts: RefCell<Vec<(String, String)>>,
        errors: RefCell<Vec<String>>,
        ready: RefCell<bool>,
    }

    impl HostEvents for RecordingEvents {
        fn set_inner_text(&self, selector: &str, text: &str) {
            self.texts
                .borrow_mut()
                .push((selector.to_string(), text.to_string()));
        }

        fn exports_ready(&self) {
            self.ready.replace(true);
        }

        fn report_error(&self, message: &str) {
            self.errors.borrow_mut().push(message.to_string());
        }
    }

    fn host_with(assets: MemoryAssets) -> (LoaderHost, Rc<RecordingEvents>, Arc<FetchInterceptor>) {
        let config = Arc::new(ProxyConfig::new(ORIGIN));
        let patcher = Patcher::for_base_path(&config.base_path, OptOutScope::WholeModule);
        let scope = Arc::new(FetchScope::network());
        let interceptor =
            FetchInterceptor::new(config.clone(), Arc::new(assets), patcher.clone(), scope.clone());
        interceptor.install();

        let events = Rc::new(RecordingEvents::default());
        let host = LoaderHost::new(HostOptions {
            config,
            patcher,
            transport: Rc::new(DirectTransport::new(scope)),
            events: events.clone(),
        })
        .unwrap();
        (host, events, interceptor)
    }

    #[tokio::test]
    async fn test_globals_installed() {
        let (mut host, _, _interceptor) = host_with(MemoryAssets::new(".gz"));
        let result = host
            .evaluate(
                r#"
                console.log('hello', { a: 1 });
                return [
                  typeof customImport,
                  getDocument().baseURI,
                  new URL('./x.js', getDocument().baseURI).href,
                  typeof Deno,
                  window === globalThis,
                ];
                "#,
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            Some(serde_json::json!([
                "function",
                "https://org.crm.dynamics.com/_framework/",
                "https://org.crm.dynamics.com/_framework/x.js",
                "undefined",
                true
            ]))
        );
        let logs = host.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "hello {\"a\":1}");
    }

    #[tokio::test]
    async fn test_timers() {
        let (mut host, _, _interceptor) = host_with(MemoryAssets::new(".gz"));
        let result = host
            .evaluate(
                r#"
                const order = [];
                await new Promise((resolve) => {
                  setTimeout(() => order.push('late'), 20);
                  setTimeout(() => order.push('early'), 1);
                  const cancelled = setTimeout(() => order.push('never'), 5);
                  clearTimeout(cancelled);
                  let ticks = 0;
                  const id = setInterval(() => {
                    ticks += 1;
                    if (ticks === 3) {
                      clearInterval(id);
                      setTimeout(() => resolve(), 30);
                    }
                  }, 2);
                });
                return order;
                "#,
            )
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!(["early", "late"])));
    }

    #[tokio::test]
    async fn test_fetch_from_isolate() {
        let (mut host, _, _interceptor) = host_with(fake_assets());
        let result = host
            .evaluate(
                r#"
                const config = await (await fetch('blazor.boot.json')).json();
                const wasm = await fetch(new URL('dotnet.native.wasm', getDocument().baseURI));
                const missing = await fetch('missing.js').then(() => 'resolved', (e) => 'rejected');
                return [
                  config.mainAssemblyName,
                  wasm.headers.get('Content-Type'),
                  (await wasm.arrayBuffer()).byteLength,
                  missing,
                ];
                "#,
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            Some(serde_json::json!(["StopwatchSample", "application/wasm", 8, "rejected"]))
        );
    }

    #[tokio::test]
    async fn test_start_invoke_and_nested_imports() {
        let (mut host, events, _interceptor) = host_with(fake_assets());
        host.start(&format!("{ORIGIN}/_framework/dotnet.js")).await.unwrap();
        assert!(*events.ready.borrow());
        assert!(events.errors.borrow().is_empty());
        assert_eq!(
            events.texts.borrow().as_slice(),
            [("#time".to_string(), "StopwatchSample:8:start".to_string())]
        );

        assert_eq!(host.invoke("StopwatchSample.Reset").await.unwrap(), None);
        assert_eq!(
            events.texts.borrow().last().unwrap(),
            &("#time".to_string(), "00:00:00".to_string())
        );

        assert_eq!(
            host.invoke("StopwatchSample.Toggle").await.unwrap(),
            Some(serde_json::json!(false))
        );
        assert_eq!(
            host.invoke("StopwatchSample.Toggle").await.unwrap(),
            Some(serde_json::json!(true))
        );

        assert!(host.invoke("StopwatchSample.Missing").await.is_err());
    }

    #[tokio::test]
    async fn test_start_reports_patch_mismatch() {
        let mut assets = fake_assets();
        assets.insert(
            "dotnet.js",
            AssetIdentifier::new("unpatchable"),
            compress(b"export const dotnet = {};"),
        );
        let (mut host, events, _interceptor) = host_with(assets);

        let err = host
            .start(&format!("{ORIGIN}/_framework/dotnet.js"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("import-hook"), "{err}");
        assert_eq!(events.errors.borrow().len(), 1);
        assert!(!*events.ready.borrow());
    }

    /// Bootstrap that opts out of patching and is already written against
    /// the hooks. Its output is a string the import rewrite would change.
    const OPTED_OUT_LOADER: &str = r##"// SKIP
const hook = "await import(";
export const dotnet = {
  withConfigSrc() { return dotnet; },
  withApplicationArguments() { return dotnet; },
  async create() {
    let dom;
    return {
      setModuleImports(_, value) { dom = value.dom; },
      getConfig() { return { mainAssemblyName: "Prebuilt" }; },
      async getAssemblyExports() { return {}; },
      async runMain() { dom.setInnerText("#time", hook); },
    };
  },
};
"##;

    #[tokio::test]
    async fn test_opted_out_bootstrap_runs_unmodified() {
        let mut assets = fake_assets();
        assets.insert(
            "dotnet.js",
            AssetIdentifier::new("opted-out"),
            compress(OPTED_OUT_LOADER.as_bytes()),
        );
        let (mut host, events, _interceptor) = host_with(assets);

        host.start(&format!("{ORIGIN}/_framework/dotnet.js")).await.unwrap();
        assert!(events.errors.borrow().is_empty());
        assert_eq!(
            events.texts.borrow().as_slice(),
            [("#time".to_string(), "await import(".to_string())]
        );
    }

    async fn echo(
        method: axum::http::Method,
        headers: axum::http::HeaderMap,
        body: axum::body::Bytes,
    ) -> String {
        let tag = headers
            .get("x-loader-tag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        format!("{method} {tag} {}", String::from_utf8_lossy(&body))
    }

    #[tokio::test]
    async fn test_passthrough_fetch_keeps_init() {
        let app = axum::Router::new().route("/api/echo", axum::routing::any(echo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut host, _, _interceptor) = host_with(MemoryAssets::new(".gz"));
        let result = host
            .evaluate(&format!(
                r#"
                const url = "http://127.0.0.1:{port}/api/echo";
                const posted = await fetch(url, {{
                  method: 'post',
                  headers: {{ 'X-Loader-Tag': 'boot' }},
                  body: 'payload',
                }});
                const put = await fetch({{ url, method: 'PUT', body: new Uint8Array([111, 107]) }});
                const plain = await fetch(url);
                return [await posted.text(), await put.text(), await plain.text()];
                "#
            ))
            .await
            .unwrap();
        assert_eq!(
            result,
            Some(serde_json::json!(["POST boot payload", "PUT - ok", "GET - "]))
        );
    }

    #[tokio::test]
    async fn test_wait_ready_requires_start() {
        let (mut host, _, _interceptor) = host_with(MemoryAssets::new(".gz"));
        assert!(host.wait_ready().await.is_err());
    }
}
