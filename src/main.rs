//! wasm-relay CLI
//!
//! Hosts one control against a live Web API (or a directory of `.gz` files)
//! and drives it from stdin.
//!
//! Usage:
//!   wasm-relay --client-url <url> [--origin <url>] [--mode inline|worker]
//!              [--token <bearer>] [--assets-dir <dir>] [--config <file.json>]
//!
//! Commands (one per line on stdin): `reset`, `toggle`, `quit`.
//!
//! Output (JSON lines to stdout):
//!   {"event":"text","selector":"#time","text":"00:00:01"}
//!   {"event":"label","label":"Start"}
//!   {"event":"error","message":"..."}
//!
//! Diagnostics go to stderr, filtered by `RUST_LOG`.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use wasm_relay_runtime::{
    AssetSource, Control, ControlMode, FetchScope, MemoryAssets, ProxyConfig, Surface,
    WebApiAssets,
};

#[derive(Parser, Debug)]
#[command(name = "wasm-relay", version, about)]
struct Cli {
    /// Base client URL of the host environment
    #[arg(long, env = "WASM_RELAY_CLIENT_URL")]
    client_url: Option<String>,

    /// Origin the loader believes it is served from (defaults to the client URL)
    #[arg(long, env = "WASM_RELAY_ORIGIN")]
    origin: Option<String>,

    /// Bearer token for the Web API
    #[arg(long, env = "WASM_RELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, value_enum, env = "WASM_RELAY_MODE")]
    mode: Option<ControlMode>,

    /// Serve assets from `*.gz` files in this directory instead of the Web API
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// JSON file with a full configuration; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<(ProxyConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config '{}'", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid config '{}'", path.display()))?
            }
            None => ProxyConfig::default(),
        };

        match self.client_url {
            Some(url) => config.client_url = url,
            None if self.config.is_none() => {
                return Err(anyhow!("--client-url or --config is required"));
            }
            None => {}
        }
        if self.origin.is_some() {
            config.origin = self.origin;
        }
        if self.token.is_some() {
            config.access_token = self.token;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        Ok((config, self.assets_dir))
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum CliEvent<'a> {
    Text { selector: &'a str, text: &'a str },
    Label { label: &'a str },
    Error { message: &'a str },
}

/// Renders surface updates as JSON lines on stdout.
struct StdoutSurface;

impl StdoutSurface {
    fn emit(&self, event: CliEvent<'_>) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("Failed to serialize event: {e}"),
        }
    }
}

impl Surface for StdoutSurface {
    fn set_inner_text(&self, selector: &str, text: &str) {
        self.emit(CliEvent::Text { selector, text });
    }

    fn set_pause_label(&self, label: &str) {
        self.emit(CliEvent::Label { label });
    }

    fn show_error(&self, message: &str) {
        self.emit(CliEvent::Error { message });
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, assets_dir) = cli.into_config()?;

    let source: Arc<dyn AssetSource> = match assets_dir {
        Some(dir) => Arc::new(MemoryAssets::load_dir(&dir, &config.compressed_suffix)?),
        None => Arc::new(WebApiAssets::new(Arc::new(config.clone()))),
    };

    let mut control = Control::init(
        config,
        source,
        Arc::new(FetchScope::network()),
        Arc::new(StdoutSurface),
    )
    .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut idle = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                match line.trim() {
                    "reset" => control.reset().await?,
                    "toggle" | "pause" => {
                        control.toggle().await?;
                    }
                    "quit" | "exit" => break,
                    "" => {}
                    other => tracing::warn!("Unknown command '{other}'"),
                }
                idle = false;
            }
            result = control.run_event_loop(), if !idle => {
                result?;
                idle = true;
            }
        }
    }

    control.destroy().await;
    Ok(())
}
