//! wasm-relay runtime - serve a WebAssembly loader from a record store
//!
//! A .NET WebAssembly loader expects to fetch its runtime files from
//! `<origin>/_framework/`. This crate runs the loader inside a V8 isolate
//! (built on `deno_core`) where no such static hosting exists: every fetch
//! under the virtualization base is resolved to a record in the host's
//! Web API, decompressed, and for scripts rewritten so the loader's own
//! imports and path lookups come back through the same interceptor.
//!
//! The loader can run inline or on a worker thread whose fetches are proxied
//! back to the main context by message.

mod bootstrap;
mod ops;

pub mod asset;
pub mod bridge;
pub mod config;
pub mod control;
pub mod decompress;
pub mod error;
pub mod fetch;
pub mod host;
pub mod interceptor;
pub mod patcher;
pub mod protocol;
pub mod webapi;

pub use asset::{
    AssetIdentifier, AssetPayload, AssetRequest, AssetSource, MemoryAssets, MimeType,
};
pub use bridge::{BridgeState, WorkerBridge};
pub use config::{ControlMode, ProxyConfig};
pub use control::{Control, MemorySurface, Surface};
pub use error::ProxyError;
pub use fetch::{Fetch, FetchRequest, FetchResponse, FetchScope, NetworkFetch, ResponseBody};
pub use host::{HostOptions, LoaderHost};
pub use interceptor::{FetchInterceptor, Route};
pub use ops::LogEntry;
pub use patcher::{OptOutScope, PatchTable, Patcher};
pub use protocol::WorkerMessage;
pub use webapi::WebApiAssets;
