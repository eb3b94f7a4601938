//! # plugin-pipeline
//!
//! Plugin registry and staged execution pipeline with mergeable run-control
//! defaults and web-triggered re-execution.
//!
//! This crate provides:
//! - **Plugin Registry** - Resolve identifiers into a dependency-ordered,
//!   deduplicated plugin sequence, rejecting cycles
//! - **Run Control** - Merge every plugin's defaults into one shared store
//!   with per-key merge functions and a "not specified" sentinel
//! - **Pipeline** - Run setup, execute and teardown across all plugins in
//!   registry order behind one failure boundary
//! - **Diagnostics** - Append a debug transcript with the error chain,
//!   captured warnings and a store dump when a run fails
//! - **Event Bridge** - Let a web response re-trigger the execute stage
//! - **Command Line** - Build one command from every plugin's options
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugin_pipeline::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::new().with_app_name("demo"));
//! runtime.loader().register_default::<MyPlugin>("my-plugin");
//!
//! let exit = runtime.run(std::env::args_os());
//! std::process::exit(exit.exit_code());
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): Run-control files in TOML or JSON
//! - `web` (default): Serve routed plugins over HTTP with axum

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod bridge;
mod builtin;
pub mod cli;
mod config;
mod diagnostics;
mod error;
mod lifecycle;
mod loader;
mod pipeline;
mod plugin;
mod registry;
mod runtime;
mod summary;

#[cfg(feature = "web")]
mod web;

pub use bridge::{EventBridge, Payload, Request, RequestMethod};
pub use builtin::{normalize_server_url, version_report, BasePlugin, BASE_PLUGIN, DEFAULT_RC_FILE};
pub use config::{merge, ConfigStore, Defaults, Docs, MergeFn, Mergers, Setting, EVENT_KEY};
pub use diagnostics::{
    Diagnostics, DiagnosticsConfig, DiagnosticsGuard, Exit, ExitReason, WarningLayer, BANNER,
};
pub use error::{Error, Result};
pub use lifecycle::{PipelineEvent, PipelineHooks, PipelineState, Stage};
pub use loader::{Loader, LoaderConfig, PluginFactory, PluginLoader};
pub use pipeline::{Flow, Pipeline};
pub use plugin::{Declared, Event, Plugin, PluginHandle};
pub use registry::{PluginRegistry, RegistryConfig, RegistryStats};
pub use runtime::{Runtime, RuntimeConfig};
pub use summary::{summarize_docs, MAX_DEFAULT, NO_DOC};

#[cfg(feature = "web")]
pub use web::{build_router, WebApp};

/// Re-exported so plugins can build their options without a direct dependency.
pub use clap;

/// Re-exported value type used by the run-control store.
pub use serde_json::{json, Value};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
