//! Worker bridge: run the loader on its own thread and proxy its fetches.
//!
//! The worker owns a [`LoaderHost`] on a dedicated thread with a
//! single-threaded tokio runtime. It shares nothing with the main context;
//! the two exchange [`WorkerMessage`]s over a pair of channels.
//!
//! Every fetch the loader issues inside the worker becomes a `fetchRequest`
//! with a fresh id. The main side serves it through its [`FetchScope`]
//! (so the interceptor applies) and answers with `fetchResponse` or
//! `fetchError` carrying the same id. A request nobody answers stays
//! pending; there is no timeout.
//!
//! Main-side state:
//!
//! ```text
//! Idle ──loadRuntime──▶ Loading ──exportsReady──▶ Ready
//!                          │                        │
//!                          └──────── error ─────────┴──▶ Failed
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::control::{pause_label, Surface};
use crate::error::ProxyError;
use crate::fetch::{FetchRequest, FetchResponse, FetchScope};
use crate::host::{FetchTransport, HostEvents, HostOptions, LoaderHost};
use crate::patcher::Patcher;
use crate::protocol::{self, Inbox, Port, WorkerMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Loading,
    Ready,
    Failed(String),
}

impl BridgeState {
    pub fn is_settled(&self) -> bool {
        matches!(self, BridgeState::Ready | BridgeState::Failed(_))
    }
}

type FetchReply = Result<FetchResponse, ProxyError>;

/// Worker-side fetches awaiting a reply, keyed by request id.
#[derive(Clone, Default)]
pub struct PendingFetches {
    inner: Rc<RefCell<HashMap<Uuid, oneshot::Sender<FetchReply>>>>,
}

impl PendingFetches {
    pub fn register(&self) -> (Uuid, oneshot::Receiver<FetchReply>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.borrow_mut().insert(id, tx);
        (id, rx)
    }

    /// Settle the request a `fetchResponse` or `fetchError` answers.
    /// Returns `false` when no request with that id is pending.
    pub fn complete(&self, message: WorkerMessage) -> bool {
        let (id, reply) = match message {
            WorkerMessage::FetchError { id, url, message } => {
                (id, Err(ProxyError::Transport(format!("{url}: {message}"))))
            }
            WorkerMessage::FetchResponse { id, .. } => (id, message.into_response()),
            other => {
                tracing::warn!("Not a fetch reply: {}", other.kind());
                return false;
            }
        };
        match self.inner.borrow_mut().remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => {
                tracing::warn!("No pending fetch with id {id}");
                false
            }
        }
    }

    /// Forget a request that will never be answered.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.inner.borrow_mut().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}

/// Worker-side transport: every fetch is a message to the main context.
struct BridgeTransport {
    port: Port,
    pending: PendingFetches,
}

#[async_trait(?Send)]
impl FetchTransport for BridgeTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError> {
        let (id, reply) = self.pending.register();
        tracing::debug!("Proxying fetch {id} for {} {}", request.method, request.url);
        if let Err(e) = self.port.send(&WorkerMessage::fetch_request(id, &request)) {
            self.pending.cancel(id);
            return Err(e);
        }
        reply
            .await
            .map_err(|_| ProxyError::Worker(format!("fetch {id} abandoned")))?
    }
}

/// Worker-side events: relayed to the main context.
struct WorkerEvents {
    port: Port,
}

impl WorkerEvents {
    fn post(&self, message: WorkerMessage) {
        if let Err(e) = self.port.send(&message) {
            tracing::warn!("Failed to post {}: {e}", message.kind());
        }
    }
}

impl HostEvents for WorkerEvents {
    fn set_inner_text(&self, selector: &str, text: &str) {
        self.post(WorkerMessage::SetInnerText {
            selector: selector.to_string(),
            text: text.to_string(),
        });
    }

    fn exports_ready(&self) {
        self.post(WorkerMessage::ExportsReady);
    }

    fn report_error(&self, message: &str) {
        self.post(WorkerMessage::Error {
            message: message.to_string(),
        });
    }
}

/// Main-side handle to one worker.
pub struct WorkerBridge {
    port: Port,
    state: watch::Receiver<BridgeState>,
    state_tx: Arc<watch::Sender<BridgeState>>,
    dispatcher: JoinHandle<()>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerBridge {
    /// Start the worker thread and the main-side dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: Arc<ProxyConfig>,
        patcher: Patcher,
        scope: Arc<FetchScope>,
        surface: Arc<dyn Surface>,
    ) -> Result<Self> {
        let (to_worker, worker_inbox) = protocol::channel();
        let (to_main, main_inbox) = protocol::channel();
        let (stop, stopped) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("wasm-relay-worker".to_string())
            .spawn(move || run_worker(config, patcher, worker_inbox, to_main, stopped))
            .context("Failed to spawn loader worker thread")?;

        let (state_tx, state) = watch::channel(BridgeState::Idle);
        let state_tx = Arc::new(state_tx);
        let dispatcher = tokio::spawn(dispatch(
            main_inbox,
            to_worker.clone(),
            scope,
            surface,
            state_tx.clone(),
        ));

        Ok(Self {
            port: to_worker,
            state,
            state_tx,
            dispatcher,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Hand the loader URL to the worker. Only valid from `Idle`.
    pub fn load_runtime(&self, url: &str) -> Result<()> {
        let moved = self.state_tx.send_if_modified(|state| {
            if *state == BridgeState::Idle {
                *state = BridgeState::Loading;
                true
            } else {
                false
            }
        });
        if !moved {
            bail!("Cannot load runtime in state {:?}", self.state());
        }
        self.port.send(&WorkerMessage::LoadRuntime {
            url: url.to_string(),
        })?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.send_when_ready(WorkerMessage::Reset)
    }

    /// The new running flag comes back asynchronously and relabels the
    /// pause button.
    pub fn toggle(&self) -> Result<()> {
        self.send_when_ready(WorkerMessage::Toggle { is_running: None })
    }

    fn send_when_ready(&self, message: WorkerMessage) -> Result<()> {
        let state = self.state();
        if state != BridgeState::Ready {
            bail!("Cannot send {} in state {state:?}", message.kind());
        }
        self.port.send(&message)?;
        Ok(())
    }

    /// Wait until the worker is ready or has failed.
    pub async fn wait_settled(&self) -> BridgeState {
        let mut state = self.state.clone();
        let settled = match state.wait_for(BridgeState::is_settled).await {
            Ok(settled) => settled.clone(),
            Err(_) => BridgeState::Failed("bridge closed".to_string()),
        };
        settled
    }

    /// Stop the worker and wait for its thread to exit.
    ///
    /// Fetches already being served on the main side are left to finish.
    pub async fn shutdown(mut self) {
        self.dispatcher.abort();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => tracing::info!("Loader worker stopped"),
                Ok(Err(_)) => tracing::error!("Loader worker panicked"),
                Err(e) => tracing::error!("Failed to join loader worker: {e}"),
            }
        }
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.dispatcher.abort();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Main-side message loop.
async fn dispatch(
    mut inbox: Inbox,
    port: Port,
    scope: Arc<FetchScope>,
    surface: Arc<dyn Surface>,
    state: Arc<watch::Sender<BridgeState>>,
) {
    while let Some(message) = inbox.recv().await {
        match message {
            WorkerMessage::FetchRequest {
                id,
                url,
                method,
                headers,
                body,
            } => {
                let fetch = scope.global();
                let port = port.clone();
                tokio::spawn(async move {
                    let served = match protocol::wire_request(url.clone(), method, headers, body) {
                        Ok(request) => fetch.fetch(request).await,
                        Err(e) => Err(e),
                    };
                    let reply = match served {
                        Ok(response) => WorkerMessage::fetch_response(id, &response),
                        Err(e) => WorkerMessage::FetchError {
                            id,
                            url,
                            message: e.to_string(),
                        },
                    };
                    if let Err(e) = port.send(&reply) {
                        tracing::warn!("Dropped reply to fetch {id}: {e}");
                    }
                });
            }
            WorkerMessage::SetInnerText { selector, text } => {
                surface.set_inner_text(&selector, &text);
            }
            WorkerMessage::Toggle {
                is_running: Some(is_running),
            } => surface.set_pause_label(pause_label(is_running)),
            WorkerMessage::Toggle { is_running: None } => {
                tracing::warn!("Worker sent toggle without a running flag");
            }
            WorkerMessage::Ready => tracing::debug!("Loader worker is up"),
            WorkerMessage::ExportsReady => {
                state.send_if_modified(|s| {
                    if matches!(s, BridgeState::Failed(_)) {
                        false
                    } else {
                        *s = BridgeState::Ready;
                        true
                    }
                });
            }
            WorkerMessage::Error { message } => {
                tracing::error!("Loader worker error: {message}");
                surface.show_error(&message);
                state.send_replace(BridgeState::Failed(message));
            }
            WorkerMessage::LoadRuntime { .. }
            | WorkerMessage::Reset
            | WorkerMessage::FetchResponse { .. }
            | WorkerMessage::FetchError { .. } => {
                tracing::warn!("Unexpected {} from worker", message.kind());
            }
        }
    }

    state.send_if_modified(|s| {
        if matches!(s, BridgeState::Failed(_)) {
            false
        } else {
            *s = BridgeState::Failed("loader worker exited".to_string());
            true
        }
    });
}

fn run_worker(
    config: Arc<ProxyConfig>,
    patcher: Patcher,
    inbox: Inbox,
    port: Port,
    stopped: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = port.send(&WorkerMessage::Error {
                message: format!("failed to start worker runtime: {e}"),
            });
            return;
        }
    };

    runtime.block_on(async move {
        if let Err(e) = worker_loop(config, patcher, inbox, port.clone(), stopped).await {
            tracing::error!("Loader worker failed: {e:#}");
            let _ = port.send(&WorkerMessage::Error {
                message: e.to_string(),
            });
        }
    });
}

async fn worker_loop(
    config: Arc<ProxyConfig>,
    patcher: Patcher,
    mut inbox: Inbox,
    port: Port,
    mut stopped: oneshot::Receiver<()>,
) -> Result<()> {
    let pending = PendingFetches::default();
    let mut host = LoaderHost::new(HostOptions {
        config: config.clone(),
        patcher,
        transport: Rc::new(BridgeTransport {
            port: port.clone(),
            pending: pending.clone(),
        }),
        events: Rc::new(WorkerEvents { port: port.clone() }),
    })?;
    port.send(&WorkerMessage::Ready)?;

    // Nothing scheduled yet, so there is no event loop to drive.
    let mut idle = true;
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            message = inbox.recv() => {
                let Some(message) = message else { break };
                handle_in_worker(&mut host, &pending, &port, &config, message).await;
                idle = false;
            }
            result = host.run_event_loop(), if !idle => {
                if let Err(e) = result {
                    tracing::error!("Loader event loop failed: {e}");
                    port.send(&WorkerMessage::Error { message: e.to_string() })?;
                }
                idle = true;
            }
        }
    }
    Ok(())
}

async fn handle_in_worker(
    host: &mut LoaderHost,
    pending: &PendingFetches,
    port: &Port,
    config: &ProxyConfig,
    message: WorkerMessage,
) {
    let outcome = match message {
        WorkerMessage::LoadRuntime { url } => host.begin(&url),
        WorkerMessage::Reset => host.invoke(&config.reset_export).await.map(|_| ()),
        WorkerMessage::Toggle { .. } => match host.invoke(&config.toggle_export).await {
            Ok(value) => match value.as_ref().and_then(Value::as_bool) {
                Some(is_running) => port
                    .send(&WorkerMessage::Toggle {
                        is_running: Some(is_running),
                    })
                    .map_err(anyhow::Error::from),
                None => Err(anyhow!(
                    "{} returned {value:?}, expected a boolean",
                    config.toggle_export
                )),
            },
            Err(e) => Err(e),
        },
        WorkerMessage::FetchResponse { .. } | WorkerMessage::FetchError { .. } => {
            pending.complete(message);
            Ok(())
        }
        WorkerMessage::SetInnerText { .. }
        | WorkerMessage::FetchRequest { .. }
        | WorkerMessage::Error { .. }
        | WorkerMessage::Ready
        | WorkerMessage::ExportsReady => {
            tracing::warn!("Unexpected {} in worker", message.kind());
            Ok(())
        }
    };

    if let Err(e) = outcome {
        tracing::error!("Worker failed to handle message: {e}");
        let _ = port.send(&WorkerMessage::Error {
            message: e.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetIdentifier, MemoryAssets};
    use crate::control::MemorySurface;
    use crate::decompress::compress;
    use crate::fetch::ResponseBody;
    use crate::host::tests::{fake_assets, ORIGIN};
    use crate::interceptor::FetchInterceptor;
    use crate::patcher::OptOutScope;
    use std::time::Duration;

    fn response(url: &str, text: &str) -> FetchResponse {
        FetchResponse::ok(url, "application/javascript", ResponseBody::Text(text.to_string()))
    }

    #[tokio::test]
    async fn test_reply_with_other_id_does_not_resolve() {
        let pending = PendingFetches::default();
        let (id, mut rx) = pending.register();

        let stray = WorkerMessage::fetch_response(Uuid::new_v4(), &response("u", "x"));
        assert!(!pending.complete(stray));
        assert!(rx.try_recv().is_err());
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(WorkerMessage::fetch_response(id, &response("u", "x"))));
        assert_eq!(rx.await.unwrap().unwrap().body, ResponseBody::Text("x".to_string()));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_same_url_requests_resolve_independently() {
        let pending = PendingFetches::default();
        let (first, first_rx) = pending.register();
        let (second, second_rx) = pending.register();
        assert_ne!(first, second);

        // Answer out of order, same URL.
        let url = "https://h/_framework/dotnet.js";
        assert!(pending.complete(WorkerMessage::fetch_response(second, &response(url, "second"))));
        assert!(pending.complete(WorkerMessage::FetchError {
            id: first,
            url: url.to_string(),
            message: "boom".to_string(),
        }));

        assert!(matches!(first_rx.await.unwrap(), Err(ProxyError::Transport(_))));
        assert_eq!(
            second_rx.await.unwrap().unwrap().body,
            ResponseBody::Text("second".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_send_leaves_nothing_pending() {
        let (port, inbox) = protocol::channel();
        drop(inbox);
        let transport = BridgeTransport {
            port,
            pending: PendingFetches::default(),
        };

        let result = transport.fetch("https://h/_framework/dotnet.js".into()).await;
        assert!(matches!(result, Err(ProxyError::Protocol(_))));
        assert!(transport.pending.is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_request_stays_pending() {
        let pending = PendingFetches::default();
        let (_, rx) = pending.register();
        let waited = tokio::time::timeout(Duration::from_millis(50), rx).await;
        assert!(waited.is_err());
        assert_eq!(pending.len(), 1);
    }

    fn spawn_bridge(assets: MemoryAssets) -> (WorkerBridge, Arc<MemorySurface>, Arc<FetchInterceptor>) {
        let config = Arc::new(ProxyConfig::new(ORIGIN));
        let patcher = Patcher::for_base_path(&config.base_path, OptOutScope::PerImport);
        let scope = Arc::new(FetchScope::network());
        let interceptor =
            FetchInterceptor::new(config.clone(), Arc::new(assets), patcher.clone(), scope.clone());
        interceptor.install();

        let surface = Arc::new(MemorySurface::default());
        let bridge = WorkerBridge::spawn(config, patcher, scope, surface.clone()).unwrap();
        (bridge, surface, interceptor)
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let (bridge, surface, _interceptor) = spawn_bridge(fake_assets());
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(bridge.reset().is_err());

        bridge
            .load_runtime(&format!("{ORIGIN}/_framework/dotnet.js"))
            .unwrap();
        assert!(bridge.load_runtime("again").is_err());
        assert_eq!(bridge.wait_settled().await, BridgeState::Ready);
        eventually(|| surface.text("#time").as_deref() == Some("StopwatchSample:8:start")).await;

        bridge.toggle().unwrap();
        eventually(|| surface.pause_label() == "Start").await;
        bridge.toggle().unwrap();
        eventually(|| surface.pause_label() == "Pause").await;

        bridge.reset().unwrap();
        eventually(|| surface.text("#time").as_deref() == Some("00:00:00")).await;

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_failure_is_terminal() {
        let mut assets = fake_assets();
        assets.insert(
            "dotnet.js",
            AssetIdentifier::new("unpatchable"),
            compress(b"export const dotnet = {};"),
        );
        let (bridge, surface, _interceptor) = spawn_bridge(assets);

        bridge
            .load_runtime(&format!("{ORIGIN}/_framework/dotnet.js"))
            .unwrap();
        match bridge.wait_settled().await {
            BridgeState::Failed(message) => assert!(message.contains("import-hook"), "{message}"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(surface.error().is_some());
        assert!(bridge.toggle().is_err());

        bridge.shutdown().await;
    }
}
