//! Top-level driver tying the command line, pipeline and exit procedure together.

use std::ffi::OsString;
use std::sync::Arc;

use crate::builtin::BASE_PLUGIN;
use crate::cli;
use crate::config::ConfigStore;
use crate::diagnostics::{Diagnostics, DiagnosticsConfig, Exit};
use crate::error::{Error, Result};
use crate::loader::{Loader, LoaderConfig, PluginLoader};
use crate::pipeline::{Flow, Pipeline};
use crate::registry::RegistryConfig;

/// Configuration for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Application name, used for the command and transcripts.
    pub app_name: String,
    /// Plugins loaded when `--plugins` is not given.
    pub plugins: Vec<String>,
    /// Loader configuration.
    pub loader: LoaderConfig,
    /// Registry configuration.
    pub registry: RegistryConfig,
    /// Diagnostics configuration.
    pub diagnostics: DiagnosticsConfig,
    /// Whether to install the console subscriber with warning capture.
    pub capture_warnings: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_name: env!("CARGO_PKG_NAME").to_string(),
            plugins: vec![BASE_PLUGIN.to_string()],
            loader: LoaderConfig::default(),
            registry: RegistryConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            capture_warnings: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the default plugin list.
    pub fn with_plugins<S: Into<String>>(mut self, plugins: impl IntoIterator<Item = S>) -> Self {
        self.plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    /// Append a plugin to the default list.
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugins.push(plugin.into());
        self
    }

    /// Set the loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Set the registry configuration.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Set the diagnostics configuration.
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsConfig) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Enable or disable the console subscriber.
    pub fn with_capture_warnings(mut self, capture: bool) -> Self {
        self.capture_warnings = capture;
        self
    }
}

/// Drives one application run.
///
/// Order: load plugins, build and parse the command line, merge defaults,
/// overlay the run-control file, overlay the command line, setup, then
/// execute (or serve) and teardown.
pub struct Runtime {
    config: RuntimeConfig,
    loader: Arc<PluginLoader>,
}

impl Runtime {
    /// Create a new runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        let loader = Arc::new(PluginLoader::new(config.loader.clone()));
        Self { config, loader }
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the plugin loader, for registering plugins.
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Plugin identifiers requested by `--plugins`, or the configured list.
    pub fn requested_plugins(&self, args: &[OsString]) -> Result<Vec<String>> {
        let requested = cli::requested_plugins(args)?;
        if requested.is_empty() {
            Ok(self.config.plugins.clone())
        } else {
            Ok(requested)
        }
    }

    /// Run everything up to and including setup.
    ///
    /// Returns `None` when the run already ended cleanly: help or version
    /// output was shown, or a setup-only run was requested.
    pub fn prepare<I, T>(
        &self,
        diagnostics: &Diagnostics,
        args: I,
    ) -> Result<Option<Arc<Pipeline>>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let loader: &dyn Loader = self.loader.as_ref();
        let pipeline = self
            .requested_plugins(&args)
            .and_then(|identifiers| {
                Pipeline::load(
                    loader,
                    &identifiers,
                    self.config.registry.clone(),
                    diagnostics.clone(),
                )
            })
            .map_err(|err| diagnostics.fail(err, &ConfigStore::new(), &[]))?;

        let mut command = pipeline.build_cli(self.config.app_name.clone());
        let matches = match cli::parse(&mut command, args) {
            Ok(matches) => matches,
            Err(Error::Cli(err)) if !err.use_stderr() => {
                err.print()?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        pipeline.configure()?;

        #[cfg(feature = "serde")]
        {
            let rc = matches
                .try_get_one::<String>("rc")
                .ok()
                .flatten()
                .map(std::path::PathBuf::from)
                .or_else(|| {
                    pipeline.with_config(|c| c.get_str("rc").map(std::path::PathBuf::from))
                });
            if let Some(rc) = rc.filter(|p| p.is_file()) {
                pipeline.update_from_file(&rc)?;
            }
        }

        pipeline.apply_cli(&command, &matches)?;

        match pipeline.setup()? {
            Flow::Continue => Ok(Some(Arc::new(pipeline))),
            Flow::Shutdown => Ok(None),
        }
    }

    /// Run the whole lifecycle once: setup, one execute pass, teardown.
    pub fn run<I, T>(&self, args: I) -> Exit
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let diagnostics = Diagnostics::new(self.config.diagnostics.clone());
        let _guard = self.config.capture_warnings.then(|| diagnostics.install());

        let pipeline = match self.prepare(&diagnostics, args) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return Exit::CleanShutdown,
            Err(err) => return Exit::Propagate(err),
        };

        match pipeline.execute().and_then(|()| pipeline.teardown()) {
            Ok(()) => Exit::CleanShutdown,
            Err(err) => Exit::Propagate(err),
        }
    }

    /// Set up, serve every routed plugin until the server stops, then tear down.
    #[cfg(feature = "web")]
    pub async fn serve<I, T>(&self, args: I) -> Exit
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let diagnostics = Diagnostics::new(self.config.diagnostics.clone());
        if self.config.capture_warnings && !diagnostics.try_init() {
            tracing::debug!("global subscriber already installed");
        }

        let pipeline = match self.prepare(&diagnostics, args) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return Exit::CleanShutdown,
            Err(err) => return Exit::Propagate(err),
        };

        let (host, port, debug) = pipeline.with_config(|c| {
            (
                c.get_str("host").unwrap_or("0.0.0.0").to_string(),
                c.get_i64("port").and_then(|p| u16::try_from(p).ok()).unwrap_or(80),
                c.get_bool("debug").unwrap_or(false),
            )
        });

        let app = crate::web::WebApp::new(pipeline.clone()).with_debug(debug);
        if let Err(err) = app.serve(&host, port).await {
            let err = pipeline.diagnostics().fail(err, &pipeline.snapshot(), pipeline.plugins());
            return Exit::Propagate(err);
        }

        match pipeline.teardown() {
            Ok(()) => Exit::CleanShutdown,
            Err(err) => Exit::Propagate(err),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("loader", &self.loader)
            .finish()
    }
}
