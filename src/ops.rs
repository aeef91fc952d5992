//! Custom deno_core operations backing the loader's globals.
//!
//! The bootstrap script wraps these into the browser-shaped API the patched
//! loader calls: `console`, timers, `URL`, `fetch`, `customImport` and
//! `getDocument`. Per-isolate state lives in `OpState` as a [`LogStorage`]
//! and a [`HostContext`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use deno_core::{op2, OpState, ToJsBuffer};
use serde::{Deserialize, Serialize};

use crate::config::ProxyConfig;
use crate::fetch::{FetchOptions, FetchRequest, FetchResponse, ResponseBody};
use crate::host::{FetchTransport, HostSignals};
use crate::patcher::Patcher;

/// A single log entry captured from the loader's console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// UTC timestamp when the log was captured
    pub timestamp: DateTime<Utc>,
    /// The log message content
    pub message: String,
}

impl LogEntry {
    /// Create a new log entry with the current timestamp
    pub fn new(message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            message,
        }
    }
}

pub type LogStorage = Rc<RefCell<Vec<LogEntry>>>;

/// Blob modules registered by `customImport`, keyed by specifier.
pub type ModuleRegistry = Rc<RefCell<HashMap<String, String>>>;

/// Document shape handed to the loader in place of a DOM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    #[serde(rename = "baseURI")]
    pub base_uri: String,
    pub location: LocationInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationInfo {
    pub href: String,
    pub host: String,
    pub origin: String,
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

impl DocumentInfo {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let base = config.base_url();
        Self {
            base_uri: base.clone(),
            location: LocationInfo {
                href: base,
                host: config.host(),
                origin: config.origin().to_string(),
                pathname: format!("/{}", config.base_path),
                search: String::new(),
                hash: String::new(),
            },
        }
    }
}

/// Everything the ops need besides the log buffer.
#[derive(Clone)]
pub struct HostContext {
    pub transport: Rc<dyn FetchTransport>,
    pub signals: Rc<HostSignals>,
    pub modules: ModuleRegistry,
    pub patcher: Rc<Patcher>,
    pub document: DocumentInfo,
}

/// Capture one console line, mirrored to tracing.
#[op2(fast)]
pub fn op_log(#[state] log_storage: &LogStorage, #[string] message: String) {
    tracing::debug!(target: "wasm_relay::console", "{message}");
    let entry = LogEntry::new(message);
    log_storage.borrow_mut().push(entry);
}

/// Get the current time in milliseconds since Unix epoch.
///
/// Backs the `performance.now()` shim.
#[op2(fast)]
pub fn op_get_time_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// Timer primitive for `setTimeout`/`setInterval`.
#[op2(async)]
pub async fn op_sleep(delay_ms: f64) {
    tokio::time::sleep(clamp_delay(delay_ms)).await;
}

fn clamp_delay(delay_ms: f64) -> Duration {
    if delay_ms.is_finite() && delay_ms > 0.0 {
        Duration::from_millis(delay_ms.min(f64::from(u32::MAX)) as u64)
    } else {
        Duration::ZERO
    }
}

/// Parsed URL, shaped like the fields of a WHATWG `URL` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlParts {
    pub href: String,
    pub origin: String,
    pub protocol: String,
    pub host: String,
    pub hostname: String,
    pub port: String,
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

pub fn parse_url(input: &str, base: Option<&str>) -> anyhow::Result<UrlParts> {
    let url = match base {
        Some(base) => url::Url::parse(base)?.join(input)?,
        None => url::Url::parse(input)?,
    };
    let hostname = url.host_str().unwrap_or_default().to_string();
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{hostname}:{port}")
    };
    Ok(UrlParts {
        href: url.as_str().to_string(),
        origin: url.origin().ascii_serialization(),
        protocol: format!("{}:", url.scheme()),
        host,
        hostname,
        port,
        pathname: url.path().to_string(),
        search: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
        hash: url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
    })
}

#[op2]
#[serde]
pub fn op_parse_url(
    #[string] input: String,
    #[string] base: Option<String>,
) -> Result<UrlParts, anyhow::Error> {
    parse_url(&input, base.as_deref()).map_err(|e| anyhow!("Invalid URL '{input}': {e}"))
}

/// What `fetch` resolves with on the JavaScript side.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReply {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub text: Option<String>,
    pub bytes: Option<ToJsBuffer>,
}

impl From<FetchResponse> for FetchReply {
    fn from(response: FetchResponse) -> Self {
        let (text, bytes) = match response.body {
            ResponseBody::Text(text) => (Some(text), None),
            ResponseBody::Binary(bytes) => (None, Some(ToJsBuffer::from(bytes))),
        };
        Self {
            url: response.url,
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            text,
            bytes,
        }
    }
}

/// Backing op for the isolate's `fetch`.
///
/// Called from JavaScript via `ops.op_fetch(url, options)` once the
/// bootstrap has resolved `url` against the document base and merged the
/// `init` argument with any request-object input. The request leaves the
/// isolate through the [`FetchTransport`] in `HostContext`: directly through
/// the fetch scope inline, or as a `fetchRequest` message from a worker.
/// Whether it is virtualized or passed through untouched is decided on the
/// far side of the transport.
///
/// # Arguments
/// * `state` - The operation state holding the `HostContext`
/// * `url` - Absolute request URL
/// * `options` - Method, headers and body; `None` for a plain `GET`
///
/// # Errors
///
/// Rejects the JavaScript promise when the transport fails. A non-success
/// HTTP status still resolves.
#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[serde] options: Option<FetchOptions>,
) -> Result<FetchReply, anyhow::Error> {
    let transport = {
        let borrowed = state.borrow();
        borrowed.borrow::<HostContext>().transport.clone()
    };
    let request = FetchRequest::new(url, options.unwrap_or_default());
    let response = transport.fetch(request).await?;
    Ok(FetchReply::from(response))
}

#[op2]
#[serde]
pub fn op_document(#[state] context: &HostContext) -> DocumentInfo {
    context.document.clone()
}

/// Register module text and return the `blob:` specifier to import it by.
///
/// `customImport` fetches a module, optionally rewrites its imports, then
/// hands the final text here. The module loader serves each registered
/// specifier exactly once and forgets it after loading.
///
/// # Arguments
/// * `context` - Host context owning the module registry
/// * `url` - The URL the text was fetched from, for logging
/// * `code` - Module source to serve under the new specifier
#[op2]
#[string]
pub fn op_register_module(
    #[state] context: &HostContext,
    #[string] url: String,
    #[string] code: String,
) -> String {
    let specifier = format!("blob:{}/{}", context.document.location.origin, uuid::Uuid::new_v4());
    tracing::debug!("Registered {url} as {specifier}");
    context.modules.borrow_mut().insert(specifier.clone(), code);
    specifier
}

/// Nested import rewrite applied by `customImport` to every module it loads.
#[op2]
#[string]
pub fn op_rewrite_imports(#[state] context: &HostContext, #[string] code: String) -> String {
    context.patcher.rewrite_nested_imports(&code)
}

#[op2(fast)]
pub fn op_set_inner_text(
    #[state] context: &HostContext,
    #[string] selector: String,
    #[string] text: String,
) {
    context.signals.set_inner_text(&selector, &text);
}

#[op2(fast)]
pub fn op_exports_ready(#[state] context: &HostContext) {
    context.signals.exports_ready();
}

#[op2(fast)]
pub fn op_report_error(#[state] context: &HostContext, #[string] message: String) {
    context.signals.report_error(&message);
}
