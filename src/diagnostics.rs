//! Diagnostics collector and the exit procedure.
//!
//! Every failure of a configuration step or lifecycle stage ends in
//! [`Diagnostics::exit`]. When debug mode is on, a transcript with the error
//! chain, the captured warnings, a dump of the run-control store and every
//! plugin's failure notes is appended to the debug file before the outcome is
//! handed back to the caller as an [`Exit`].
//!
//! Warnings are ordinary `tracing` events at `WARN` level. The collector's
//! [`WarningLayer`] records them while debug mode is on; [`Diagnostics::install`]
//! scopes a console subscriber plus that layer to the returned guard.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::plugin::PluginHandle;

/// Delimiter between transcript blocks and sections.
pub const BANNER: &str =
    "~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=~=";

/// Configuration for the diagnostics collector.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Force debug mode regardless of the store's `debug` key.
    pub debug: bool,
    /// Transcript file, used when the store has no `debug_filename`.
    pub debug_file: PathBuf,
    /// Application name used in transcript headers.
    pub app_name: String,
    /// Console log level of the installed subscriber.
    pub log_level: Level,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            debug: false,
            debug_file: PathBuf::from("debug.txt"),
            app_name: env!("CARGO_PKG_NAME").to_string(),
            log_level: Level::INFO,
        }
    }
}

impl DiagnosticsConfig {
    /// Create a new diagnostics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the transcript file.
    pub fn with_debug_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_file = path.into();
        self
    }

    /// Set the application name.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the console log level.
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }
}

/// Why the exit procedure was entered.
#[derive(Debug)]
pub enum ExitReason {
    /// Deliberate early stop, such as a setup-only run.
    Requested,
    /// A step failed.
    Failed(Error),
}

impl From<Error> for ExitReason {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

/// Outcome of the exit procedure, interpreted by the top-level caller.
#[derive(Debug)]
pub enum Exit {
    /// Stop without error.
    CleanShutdown,
    /// Stop and surface the original failure.
    Propagate(Error),
}

impl Exit {
    /// Process exit code: 0 for a clean shutdown, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CleanShutdown => 0,
            Self::Propagate(_) => 1,
        }
    }

    /// Check if this is a clean shutdown.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::CleanShutdown)
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::CleanShutdown => Ok(()),
            Self::Propagate(err) => Err(err),
        }
    }
}

/// Collects warnings and writes diagnostic transcripts.
///
/// Clones share the same warning list and debug flag.
#[derive(Clone)]
pub struct Diagnostics {
    config: DiagnosticsConfig,
    warnings: Arc<Mutex<Vec<String>>>,
    debug: Arc<AtomicBool>,
}

impl Diagnostics {
    /// Create a new collector.
    pub fn new(config: DiagnosticsConfig) -> Self {
        let debug = Arc::new(AtomicBool::new(config.debug));
        Self {
            config,
            warnings: Arc::new(Mutex::new(Vec::new())),
            debug,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    /// Check if debug mode is on.
    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Turn debug mode on or off. The configured flag always wins.
    pub fn set_debug(&self, debug: bool) {
        self.debug.store(self.config.debug || debug, Ordering::Relaxed);
    }

    /// Follow the store's `debug` key.
    pub fn sync_debug(&self, store: &ConfigStore) {
        self.set_debug(store.get_bool("debug").unwrap_or(false));
    }

    /// Warnings captured so far.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    /// Record a warning directly.
    pub fn record_warning(&self, message: impl Into<String>) {
        self.warnings.lock().push(message.into());
    }

    /// Drop captured warnings.
    pub fn clear_warnings(&self) {
        self.warnings.lock().clear();
    }

    /// A layer that records `WARN` events while debug mode is on.
    pub fn layer(&self) -> WarningLayer {
        WarningLayer {
            warnings: self.warnings.clone(),
            debug: self.debug.clone(),
        }
    }

    /// Install a console subscriber with warning capture for the current
    /// thread until the guard is dropped.
    pub fn install(&self) -> DiagnosticsGuard {
        let subscriber = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_filter(LevelFilter::from_level(self.config.log_level)),
            )
            .with(self.layer());
        DiagnosticsGuard {
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    /// Install the same subscriber process-wide.
    ///
    /// Returns `false` if a global subscriber was already set.
    pub fn try_init(&self) -> bool {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_filter(LevelFilter::from_level(self.config.log_level)),
            )
            .with(self.layer())
            .try_init()
            .is_ok()
    }

    /// Run the exit procedure.
    ///
    /// In debug mode (configured, or the store's `debug` key) a transcript
    /// is appended to the debug file first. A requested exit becomes
    /// [`Exit::CleanShutdown`]; a failure is always handed back unchanged.
    pub fn exit(&self, reason: ExitReason, store: &ConfigStore, plugins: &[PluginHandle]) -> Exit {
        match reason {
            ExitReason::Requested => {
                self.record(None, store, plugins);
                Exit::CleanShutdown
            }
            ExitReason::Failed(err) => Exit::Propagate(self.fail(err, store, plugins)),
        }
    }

    /// Run the exit procedure for a failure and return the error.
    pub fn fail(&self, err: Error, store: &ConfigStore, plugins: &[PluginHandle]) -> Error {
        self.record(Some(&err), store, plugins);
        err
    }

    fn record(&self, failure: Option<&Error>, store: &ConfigStore, plugins: &[PluginHandle]) {
        let debug = self.is_debug() || store.get_bool("debug").unwrap_or(false);
        if !debug {
            return;
        }

        let path = store
            .get_str("debug_filename")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.debug_file.clone());
        let transcript = self.render(failure, store, plugins);

        match append(&path, &transcript) {
            Ok(()) => tracing::info!(path = %path.display(), "wrote diagnostic transcript"),
            Err(e) => tracing::error!(
                path = %path.display(),
                error = %e,
                "failed to write diagnostic transcript"
            ),
        }
    }

    /// Render one transcript block.
    pub fn transcript(
        &self,
        reason: &ExitReason,
        store: &ConfigStore,
        plugins: &[PluginHandle],
    ) -> String {
        let failure = match reason {
            ExitReason::Failed(err) => Some(err),
            ExitReason::Requested => None,
        };
        self.render(failure, store, plugins)
    }

    fn render(
        &self,
        failure: Option<&Error>,
        store: &ConfigStore,
        plugins: &[PluginHandle],
    ) -> String {
        let app = store.get_str("appname").unwrap_or(&self.config.app_name);
        let sep = format!("{}\n\n", BANNER);
        let mut msg = String::new();

        match failure {
            Some(err) => {
                let _ = write!(msg, "{}{} failed with the following error:\n\n{}\n", sep, app, err);
                let mut source = std::error::Error::source(err);
                while let Some(cause) = source {
                    let _ = writeln!(msg, "  caused by: {}", cause);
                    source = std::error::Error::source(cause);
                }
            }
            None => {
                let _ = writeln!(msg, "{}{} exited on request", sep, app);
            }
        }

        let warnings = self.warnings.lock();
        if !warnings.is_empty() {
            let _ = write!(
                msg,
                "\n{}{} issued the following warnings:\n\n{}\n\n",
                sep,
                app,
                warnings.join("\n")
            );
        }
        drop(warnings);

        let _ = write!(msg, "\n{}Run control run-time contents:\n\n{}\n\n", sep, store.pformat());

        for plugin in plugins {
            if let Some(text) = plugin.plugin().describe_failure(store) {
                if !text.is_empty() {
                    msg.push_str(&sep);
                    msg.push_str(&text);
                }
            }
        }
        msg
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DiagnosticsConfig::default())
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("config", &self.config)
            .field("debug", &self.is_debug())
            .field("warnings", &self.warnings.lock().len())
            .finish()
    }
}

fn append(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())
}

/// Keeps the subscriber from [`Diagnostics::install`] active.
pub struct DiagnosticsGuard {
    _guard: tracing::subscriber::DefaultGuard,
}

impl std::fmt::Debug for DiagnosticsGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsGuard").finish_non_exhaustive()
    }
}

/// Tracing layer feeding `WARN` events into a [`Diagnostics`] collector.
pub struct WarningLayer {
    warnings: Arc<Mutex<Vec<String>>>,
    debug: Arc<AtomicBool>,
}

impl<S> Layer<S> for WarningLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() != Level::WARN || !self.debug.load(Ordering::Relaxed) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let entry = format!(
            "{}: '{}' from {}:{}",
            meta.target(),
            visitor.finish(),
            meta.file().unwrap_or("<unknown>"),
            meta.line().unwrap_or(0)
        );
        self.warnings.lock().push(entry);
    }
}

impl std::fmt::Debug for WarningLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarningLayer")
            .field("debug", &self.debug.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Plugin;

    struct Noted;

    impl Plugin for Noted {
        fn describe_failure(&self, config: &ConfigStore) -> Option<String> {
            Some(format!("answer was {}", config.get_i64("answer").unwrap_or(0)))
        }
    }

    struct Silent;

    impl Plugin for Silent {}

    fn plugins() -> Vec<PluginHandle> {
        vec![
            PluginHandle::new("noted", Arc::new(Noted)),
            PluginHandle::new("silent", Arc::new(Silent)),
        ]
    }

    #[test]
    fn test_config_builder() {
        let config = DiagnosticsConfig::new()
            .with_debug(true)
            .with_debug_file("out.txt")
            .with_app_name("demo")
            .with_log_level(Level::DEBUG);

        assert!(config.debug);
        assert_eq!(config.debug_file, PathBuf::from("out.txt"));
        assert_eq!(config.app_name, "demo");
    }

    #[test]
    fn test_exit_outcomes() {
        let diagnostics = Diagnostics::default();
        let store = ConfigStore::new();

        let exit = diagnostics.exit(ExitReason::Requested, &store, &[]);
        assert!(exit.is_clean());
        assert_eq!(exit.exit_code(), 0);

        let exit = diagnostics.exit(Error::plugin("boom").into(), &store, &[]);
        assert_eq!(exit.exit_code(), 1);
        assert!(matches!(exit.into_result(), Err(Error::Plugin(ref m)) if m == "boom"));
    }

    #[test]
    fn test_no_transcript_without_debug() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.txt");
        let diagnostics = Diagnostics::new(DiagnosticsConfig::new().with_debug_file(&path));

        let _ = diagnostics.exit(Error::plugin("boom").into(), &ConfigStore::new(), &[]);
        assert!(!path.exists());
    }

    #[test]
    fn test_transcript_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.txt");
        let diagnostics = Diagnostics::new(DiagnosticsConfig::new().with_app_name("demo"));

        let mut store = ConfigStore::new();
        store.set("debug", true);
        store.set("debug_filename", path.display().to_string());
        store.set("answer", 42);

        let err = Error::stage_failed(crate::lifecycle::Stage::Execute, "b", Error::plugin("boom"));
        let _ = diagnostics.exit(err.into(), &store, &plugins());
        let _ = diagnostics.exit(ExitReason::Requested, &store, &plugins());

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("demo failed with the following error:"));
        assert!(text.contains("execute failed in b: boom"));
        assert!(text.contains("caused by: boom"));
        assert!(text.contains("Run control run-time contents:"));
        assert!(text.contains("answer: 42"));
        assert!(text.contains("answer was 42"));
        assert!(text.contains("demo exited on request"));
        assert!(!text.contains("issued the following warnings"));
    }

    #[test]
    fn test_warning_capture() {
        let diagnostics = Diagnostics::new(DiagnosticsConfig::new().with_log_level(Level::ERROR));
        let _guard = diagnostics.install();

        tracing::warn!("ignored while debug is off");
        diagnostics.set_debug(true);
        tracing::warn!(key = "port", "suspicious value");
        tracing::info!("not a warning");

        let warnings = diagnostics.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'suspicious value key=port'"));
        assert!(warnings[0].contains("diagnostics.rs:"));

        let transcript = diagnostics.transcript(&ExitReason::Requested, &ConfigStore::new(), &[]);
        assert!(transcript.contains("issued the following warnings"));
    }

    #[test]
    fn test_configured_debug_wins() {
        let diagnostics = Diagnostics::new(DiagnosticsConfig::new().with_debug(true));
        diagnostics.set_debug(false);
        assert!(diagnostics.is_debug());

        let diagnostics = Diagnostics::default();
        let mut store = ConfigStore::new();
        store.set("debug", true);
        diagnostics.sync_debug(&store);
        assert!(diagnostics.is_debug());
    }
}
