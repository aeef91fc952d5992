//! Control lifecycle: initialize, update, outputs, destroy.
//!
//! A [`Control`] owns one fetch interceptor and one loader, running either
//! inline on the caller's thread or behind a [`WorkerBridge`]. UI effects go
//! to a [`Surface`]: the output element, the pause button label and an
//! error state shown when the loader cannot start.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::asset::AssetSource;
use crate::bridge::{BridgeState, WorkerBridge};
use crate::config::{ControlMode, ProxyConfig};
use crate::fetch::FetchScope;
use crate::host::{DirectTransport, HostEvents, HostOptions, LoaderHost};
use crate::interceptor::FetchInterceptor;
use crate::patcher::{OptOutScope, Patcher};

/// Label for the pause button given the loader's running flag.
pub fn pause_label(is_running: bool) -> &'static str {
    if is_running {
        "Pause"
    } else {
        "Start"
    }
}

/// Where the control renders.
pub trait Surface: Send + Sync {
    fn set_inner_text(&self, selector: &str, text: &str);
    fn set_pause_label(&self, label: &str);
    fn show_error(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SurfaceState {
    texts: HashMap<String, String>,
    pause_label: String,
    error: Option<String>,
}

/// Surface that just remembers what was rendered.
#[derive(Debug)]
pub struct MemorySurface {
    state: Mutex<SurfaceState>,
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self {
            state: Mutex::new(SurfaceState {
                texts: HashMap::new(),
                pause_label: pause_label(true).to_string(),
                error: None,
            }),
        }
    }
}

impl MemorySurface {
    fn read<T>(&self, f: impl FnOnce(&SurfaceState) -> T) -> T {
        f(&self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self, f: impl FnOnce(&mut SurfaceState)) {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn text(&self, selector: &str) -> Option<String> {
        self.read(|s| s.texts.get(selector).cloned())
    }

    pub fn pause_label(&self) -> String {
        self.read(|s| s.pause_label.clone())
    }

    pub fn error(&self) -> Option<String> {
        self.read(|s| s.error.clone())
    }
}

impl Surface for MemorySurface {
    fn set_inner_text(&self, selector: &str, text: &str) {
        self.write(|s| {
            s.texts.insert(selector.to_string(), text.to_string());
        });
    }

    fn set_pause_label(&self, label: &str) {
        self.write(|s| s.pause_label = label.to_string());
    }

    fn show_error(&self, message: &str) {
        self.write(|s| s.error = Some(message.to_string()));
    }
}

type InlineState = Rc<RefCell<BridgeState>>;

/// Inline-mode events go straight to the surface and move the control's
/// state the same way worker messages move the bridge's.
struct SurfaceEvents {
    surface: Arc<dyn Surface>,
    state: InlineState,
}

impl HostEvents for SurfaceEvents {
    fn set_inner_text(&self, selector: &str, text: &str) {
        self.surface.set_inner_text(selector, text);
    }

    fn exports_ready(&self) {
        let mut state = self.state.borrow_mut();
        if !matches!(*state, BridgeState::Failed(_)) {
            *state = BridgeState::Ready;
        }
    }

    fn report_error(&self, message: &str) {
        self.surface.show_error(message);
        self.state.replace(BridgeState::Failed(message.to_string()));
    }
}

enum Backend {
    Inline {
        host: Box<LoaderHost>,
        state: InlineState,
    },
    Worker(WorkerBridge),
}

pub struct Control {
    config: Arc<ProxyConfig>,
    interceptor: Arc<FetchInterceptor>,
    surface: Arc<dyn Surface>,
    backend: Backend,
}

impl Control {
    /// Install the interceptor and start the loader.
    ///
    /// Inline mode returns once the loader is ready or has failed; a failure
    /// is shown on the surface and leaves the control inert rather than
    /// failing `init`. Worker mode returns as soon as the worker has the
    /// loader URL; see [`Control::ready`].
    ///
    /// # Errors
    ///
    /// Invalid configuration, or an isolate or worker that cannot be created.
    pub async fn init(
        config: ProxyConfig,
        source: Arc<dyn AssetSource>,
        scope: Arc<FetchScope>,
        surface: Arc<dyn Surface>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let opt_out = match config.mode {
            ControlMode::Inline => OptOutScope::WholeModule,
            ControlMode::Worker => OptOutScope::PerImport,
        };
        let patcher = Patcher::for_base_path(&config.base_path, opt_out);
        let interceptor =
            FetchInterceptor::new(config.clone(), source, patcher.clone(), scope.clone());
        interceptor.install();

        let bootstrap_url = config.bootstrap_url();
        let backend = match config.mode {
            ControlMode::Inline => {
                let state: InlineState = Rc::new(RefCell::new(BridgeState::Loading));
                let mut host = LoaderHost::new(HostOptions {
                    config: config.clone(),
                    patcher,
                    transport: Rc::new(DirectTransport::new(scope)),
                    events: Rc::new(SurfaceEvents {
                        surface: surface.clone(),
                        state: state.clone(),
                    }),
                })
                .context("Failed to create loader isolate")?;
                if let Err(e) = host.start(&bootstrap_url).await {
                    let message = e.to_string();
                    tracing::error!("Loader failed to start: {message}");
                    if !matches!(*state.borrow(), BridgeState::Failed(_)) {
                        surface.show_error(&message);
                        state.replace(BridgeState::Failed(message));
                    }
                }
                Backend::Inline {
                    host: Box::new(host),
                    state,
                }
            }
            ControlMode::Worker => {
                let bridge =
                    WorkerBridge::spawn(config.clone(), patcher, scope, surface.clone())?;
                bridge.load_runtime(&bootstrap_url)?;
                Backend::Worker(bridge)
            }
        };

        tracing::info!("Control initialized in {:?} mode", config.mode);
        Ok(Self {
            config,
            interceptor,
            surface,
            backend,
        })
    }

    pub fn state(&self) -> BridgeState {
        match &self.backend {
            Backend::Inline { state, .. } => state.borrow().clone(),
            Backend::Worker(bridge) => bridge.state(),
        }
    }

    /// Wait until the loader is ready or has failed.
    pub async fn ready(&self) -> BridgeState {
        match &self.backend {
            Backend::Inline { state, .. } => state.borrow().clone(),
            Backend::Worker(bridge) => bridge.wait_settled().await,
        }
    }

    /// Reset button. Ignored until the loader is ready.
    pub async fn reset(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Inline { host, state } => {
                let current = state.borrow().clone();
                if current != BridgeState::Ready {
                    tracing::warn!("Reset ignored in state {current:?}");
                    return Ok(());
                }
                host.invoke(&self.config.reset_export).await?;
            }
            Backend::Worker(bridge) => {
                if let Err(e) = bridge.reset() {
                    tracing::warn!("Reset ignored: {e}");
                }
            }
        }
        Ok(())
    }

    /// Pause button. Inline mode returns the new running flag; in worker
    /// mode it arrives later and relabels the button then.
    pub async fn toggle(&mut self) -> Result<Option<bool>> {
        match &mut self.backend {
            Backend::Inline { host, state } => {
                let current = state.borrow().clone();
                if current != BridgeState::Ready {
                    tracing::warn!("Toggle ignored in state {current:?}");
                    return Ok(None);
                }
                let value = host.invoke(&self.config.toggle_export).await?;
                let is_running = value.as_ref().and_then(Value::as_bool);
                if let Some(is_running) = is_running {
                    self.surface.set_pause_label(pause_label(is_running));
                }
                Ok(is_running)
            }
            Backend::Worker(bridge) => {
                if let Err(e) = bridge.toggle() {
                    tracing::warn!("Toggle ignored: {e}");
                }
                Ok(None)
            }
        }
    }

    /// Property updates from the host. The rendered layout is fixed.
    pub fn update_view(&mut self) {
        tracing::trace!("update_view");
    }

    /// The control binds no outputs.
    pub fn outputs(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    /// Drive inline timers and fetches until nothing is pending. In worker
    /// mode the worker drives itself; this waits for it to settle instead.
    pub async fn run_event_loop(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Inline { host, .. } => host.run_event_loop().await,
            Backend::Worker(bridge) => {
                bridge.wait_settled().await;
                Ok(())
            }
        }
    }

    /// Restore the original fetch and stop the worker, if any.
    pub async fn destroy(self) {
        self.interceptor.release();
        if let Backend::Worker(bridge) = self.backend {
            bridge.shutdown().await;
        }
        tracing::info!("Control destroyed");
    }
}
