//! The staged execution pipeline.
//!
//! A [`Pipeline`] owns the registry, the single shared [`ConfigStore`] and
//! the diagnostics collector. Stages run every plugin in registry order; the
//! first failure aborts the rest of that stage and goes through the exit
//! procedure.
//!
//! The store and the lifecycle state sit behind one lock. Every stage, every
//! store overlay and every bridged response with its triggered execute pass
//! holds that lock from start to finish, so concurrent callers are
//! serialized. Plugin operations run under the lock and must not call back
//! into the pipeline.

use std::time::Instant;

use clap::{ArgMatches, Command};
use parking_lot::{Mutex, RwLock};

use crate::bridge::{Payload, Request};
use crate::cli;
use crate::config::{ConfigStore, Setting, EVENT_KEY};
use crate::diagnostics::{Diagnostics, Exit, ExitReason};
use crate::error::{Error, Result};
use crate::lifecycle::{PipelineEvent, PipelineHooks, PipelineState, Stage};
use crate::loader::Loader;
use crate::plugin::PluginHandle;
use crate::registry::{PluginRegistry, RegistryConfig};

/// What the caller should do after [`Pipeline::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Go on to execute or serve.
    Continue,
    /// A clean early stop was requested; the exit procedure already ran.
    Shutdown,
}

struct Inner {
    store: ConfigStore,
    state: PipelineState,
}

/// Registry, shared store and lifecycle of one run.
pub struct Pipeline {
    registry: PluginRegistry,
    diagnostics: Diagnostics,
    inner: Mutex<Inner>,
    hooks: RwLock<PipelineHooks>,
}

impl Pipeline {
    /// Create a pipeline over an already built registry.
    pub fn new(registry: PluginRegistry, diagnostics: Diagnostics) -> Self {
        Self {
            registry,
            diagnostics,
            inner: Mutex::new(Inner {
                store: ConfigStore::new(),
                state: PipelineState::Built,
            }),
            hooks: RwLock::new(PipelineHooks::new()),
        }
    }

    /// Resolve `identifiers` and create a pipeline over them.
    pub fn load<S: AsRef<str>>(
        loader: &dyn Loader,
        identifiers: &[S],
        config: RegistryConfig,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let registry = PluginRegistry::load(loader, identifiers, config)?;
        Ok(Self::new(registry, diagnostics))
    }

    /// Get the registry.
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Plugins in execution order.
    pub fn plugins(&self) -> &[PluginHandle] {
        self.registry.plugins()
    }

    /// Get the diagnostics collector.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.inner.lock().state
    }

    /// Add a lifecycle event handler.
    ///
    /// Handlers run after the pipeline lock is released.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.hooks.write().on_event(handler);
    }

    /// Read the store.
    pub fn with_config<R>(&self, f: impl FnOnce(&ConfigStore) -> R) -> R {
        f(&self.inner.lock().store)
    }

    /// Mutate the store directly, bypassing merge functions.
    pub fn with_config_mut<R>(&self, f: impl FnOnce(&mut ConfigStore) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner.store);
        self.diagnostics.sync_debug(&inner.store);
        result
    }

    /// Copy of the current store.
    pub fn snapshot(&self) -> ConfigStore {
        self.inner.lock().store.clone()
    }

    /// Build the command line from every plugin's options.
    pub fn build_cli(&self, name: impl Into<String>) -> Command {
        cli::build_command(name, self.registry.plugins())
    }

    /// Merge every plugin's defaults into a fresh store.
    pub fn configure(&self) -> Result<()> {
        let mut events = Vec::new();
        let result = self.configure_locked(&mut events);
        self.emit_all(&events);
        result
    }

    fn configure_locked(&self, events: &mut Vec<PipelineEvent>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.can_configure() {
            return Err(Error::invalid_state("built", inner.state.to_string()));
        }

        inner.store = ConfigStore::new();
        for plugin in self.registry.iter() {
            if let Err(err) = inner.store.apply_plugin(plugin) {
                inner.state = PipelineState::Failed;
                tracing::error!(plugin = plugin.id(), error = %err, "configuration aborted");
                return Err(self.diagnostics.fail(err, &inner.store, self.plugins()));
            }
        }

        self.diagnostics.sync_debug(&inner.store);
        inner.state = PipelineState::Configured;
        tracing::info!(keys = inner.store.len(), "defaults merged");
        events.push(PipelineEvent::Configured {
            keys: inner.store.len(),
            at: Instant::now(),
        });
        Ok(())
    }

    /// Apply an overlay with merge semantics.
    pub fn update<I, K>(&self, source: &str, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Setting)>,
        K: Into<String>,
    {
        let mut inner = self.inner.lock();
        if let Err(err) = inner.store.update(source, entries) {
            tracing::error!(source, error = %err, "overlay aborted");
            return Err(self.diagnostics.fail(err, &inner.store, self.plugins()));
        }
        self.diagnostics.sync_debug(&inner.store);
        Ok(())
    }

    /// Apply a TOML or JSON run-control file with merge semantics.
    #[cfg(feature = "serde")]
    pub fn update_from_file(&self, path: &std::path::Path) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Err(err) = inner.store.update_from_file(path) {
            tracing::error!(path = %path.display(), error = %err, "run control file rejected");
            return Err(self.diagnostics.fail(err, &inner.store, self.plugins()));
        }
        tracing::info!(path = %path.display(), "applied run control file");
        self.diagnostics.sync_debug(&inner.store);
        Ok(())
    }

    /// Apply the values given explicitly on the command line.
    pub fn apply_cli(&self, command: &Command, matches: &ArgMatches) -> Result<()> {
        let overrides = cli::overrides(command, matches);
        tracing::debug!(count = overrides.len(), "applying command line overrides");
        self.update("command line", overrides)
    }

    /// Run every plugin's `setup`.
    ///
    /// When `only_setup` is true afterwards, the exit procedure runs and
    /// [`Flow::Shutdown`] is returned.
    pub fn setup(&self) -> Result<Flow> {
        let mut events = Vec::new();
        let result = self.setup_locked(&mut events);
        self.emit_all(&events);
        result
    }

    fn setup_locked(&self, events: &mut Vec<PipelineEvent>) -> Result<Flow> {
        let mut inner = self.inner.lock();
        if !inner.state.can_setup() {
            return Err(Error::invalid_state("configured", inner.state.to_string()));
        }

        if let Err(err) = self.run_stage(&mut inner.store, Stage::Setup, events) {
            inner.state = PipelineState::Failed;
            return Err(self.diagnostics.fail(err, &inner.store, self.plugins()));
        }
        inner.state = PipelineState::SetUp;

        if inner.store.get_bool("only_setup").unwrap_or(false) {
            tracing::info!("setup-only run, shutting down");
            return match self
                .diagnostics
                .exit(ExitReason::Requested, &inner.store, self.plugins())
            {
                Exit::CleanShutdown => Ok(Flow::Shutdown),
                Exit::Propagate(err) => Err(err),
            };
        }
        Ok(Flow::Continue)
    }

    /// Run every plugin's `execute`. Repeatable between setup and teardown.
    pub fn execute(&self) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            self.execute_locked(&mut inner, &mut events)
        };
        self.emit_all(&events);
        result
    }

    fn execute_locked(&self, inner: &mut Inner, events: &mut Vec<PipelineEvent>) -> Result<()> {
        if !inner.state.can_execute() {
            return Err(Error::invalid_state("set-up or idle", inner.state.to_string()));
        }

        inner.state = PipelineState::Executing;
        let result = self.run_stage(&mut inner.store, Stage::Execute, events);
        inner.state = PipelineState::Idle;
        result.map_err(|err| self.diagnostics.fail(err, &inner.store, self.plugins()))
    }

    /// Run every plugin's `teardown`.
    pub fn teardown(&self) -> Result<()> {
        let mut events = Vec::new();
        let result = self.teardown_locked(&mut events);
        self.emit_all(&events);
        result
    }

    fn teardown_locked(&self, events: &mut Vec<PipelineEvent>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.can_teardown() {
            return Err(Error::invalid_state("set-up, idle or failed", inner.state.to_string()));
        }

        let result = self.run_stage(&mut inner.store, Stage::Teardown, events);
        inner.state = PipelineState::TornDown;
        result.map_err(|err| self.diagnostics.fail(err, &inner.store, self.plugins()))
    }

    /// Run the exit procedure against the current store.
    pub fn exit(&self, reason: ExitReason) -> Exit {
        let inner = self.inner.lock();
        self.diagnostics.exit(reason, &inner.store, self.plugins())
    }

    /// Answer `request` with `plugin`; an event triggers one execute pass.
    ///
    /// The event is stored under [`EVENT_KEY`] for the pass and removed
    /// afterwards, whether the pass succeeded or not.
    pub(crate) fn respond(&self, plugin: &PluginHandle, request: &Request) -> Result<Payload> {
        let mut events = Vec::new();
        let result = self.respond_locked(plugin, request, &mut events);
        self.emit_all(&events);
        result
    }

    fn respond_locked(
        &self,
        plugin: &PluginHandle,
        request: &Request,
        events: &mut Vec<PipelineEvent>,
    ) -> Result<Payload> {
        let mut inner = self.inner.lock();
        if !inner.state.can_execute() {
            return Err(Error::invalid_state("set-up or idle", inner.state.to_string()));
        }

        let (payload, event) = match plugin.plugin().respond(&mut inner.store, request) {
            Ok(response) => response,
            Err(source) => {
                let err = Error::respond_failed(plugin.id(), source);
                tracing::error!(
                    plugin = plugin.id(),
                    path = %request.path,
                    error = %err,
                    "response failed"
                );
                return Err(self.diagnostics.fail(err, &inner.store, self.plugins()));
            }
        };

        if let Some(event) = event {
            tracing::debug!(plugin = plugin.id(), "response produced an event");
            events.push(PipelineEvent::EventDispatched {
                plugin: plugin.id().to_string(),
                at: Instant::now(),
            });
            inner.store.set(EVENT_KEY, event);
            let result = self.execute_locked(&mut inner, events);
            inner.store.remove(EVENT_KEY);
            result?;
        }
        Ok(payload)
    }

    fn run_stage(
        &self,
        store: &mut ConfigStore,
        stage: Stage,
        events: &mut Vec<PipelineEvent>,
    ) -> Result<()> {
        tracing::info!(stage = %stage, plugins = self.registry.len(), "stage started");
        events.push(PipelineEvent::StageStarted {
            stage,
            at: Instant::now(),
        });

        for plugin in self.registry.iter() {
            tracing::debug!(stage = %stage, plugin = plugin.id(), "invoking plugin");
            let result = match stage {
                Stage::Setup => plugin.plugin().setup(store),
                Stage::Execute => plugin.plugin().execute(store),
                Stage::Teardown => plugin.plugin().teardown(store),
            };

            if let Err(source) = result {
                tracing::error!(
                    stage = %stage,
                    plugin = plugin.id(),
                    error = %source,
                    "stage aborted"
                );
                events.push(PipelineEvent::StageFailed {
                    stage,
                    plugin: plugin.id().to_string(),
                    message: source.to_string(),
                    at: Instant::now(),
                });
                return Err(Error::stage_failed(stage, plugin.id(), source));
            }
        }

        tracing::info!(stage = %stage, "stage completed");
        events.push(PipelineEvent::StageCompleted {
            stage,
            plugins: self.registry.len(),
            at: Instant::now(),
        });
        Ok(())
    }

    fn emit_all(&self, events: &[PipelineEvent]) {
        if events.is_empty() {
            return;
        }
        let hooks = self.hooks.read();
        for event in events {
            hooks.emit(event);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("registry", &self.registry)
            .field("state", &self.state())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}
