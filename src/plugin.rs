//! Plugin contract and loaded plugin handles.

use std::sync::Arc;

use clap::Command;
use serde_json::Value;

use crate::bridge::{Payload, Request, RequestMethod};
use crate::config::{ConfigStore, Defaults, Docs, Mergers};
use crate::error::Result;

/// Opaque value produced by [`Plugin::respond`] to re-trigger execution.
pub type Event = Value;

/// A declaration given either as a value or as a producer invoked at load time.
pub enum Declared<T> {
    /// Fixed value.
    Static(T),
    /// Producer called once when the plugin is loaded.
    Dynamic(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> Declared<T> {
    /// Wrap a producer function.
    pub fn dynamic<F>(producer: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(producer))
    }

    /// Resolve to a concrete value.
    pub fn resolve(&self) -> T {
        match self {
            Self::Static(value) => value.clone(),
            Self::Dynamic(producer) => producer(),
        }
    }
}

impl<T: Default> Default for Declared<T> {
    fn default() -> Self {
        Self::Static(T::default())
    }
}

impl<T> From<T> for Declared<T> {
    fn from(value: T) -> Self {
        Self::Static(value)
    }
}

/// A unit of functionality contributing options, defaults and staged behavior.
///
/// Every method has a no-op default so implementors override only what they
/// need. Operations receive the shared [`ConfigStore`] and may mutate it in
/// place; later plugins observe those changes.
pub trait Plugin: Send + Sync {
    /// Identifiers of plugins that must run before this one.
    fn requires(&self) -> Declared<Vec<String>> {
        Declared::default()
    }

    /// Default configuration values.
    fn defaults(&self) -> Declared<Defaults> {
        Declared::default()
    }

    /// Per-key merge functions.
    fn mergers(&self) -> Declared<Mergers> {
        Declared::default()
    }

    /// Per-key documentation.
    fn docs(&self) -> Declared<Docs> {
        Declared::default()
    }

    /// Web route, `None` when the plugin is not web-reachable.
    fn route(&self) -> Option<String> {
        None
    }

    /// Request methods accepted on [`Plugin::route`].
    fn methods(&self) -> Vec<RequestMethod> {
        vec![RequestMethod::Get]
    }

    /// Add command-line options. Option ids should match configuration keys
    /// and must not carry default values.
    fn configure(&self, command: Command) -> Command {
        command
    }

    /// Validate and normalize configuration, prepare the environment.
    fn setup(&self, _config: &mut ConfigStore) -> Result<()> {
        Ok(())
    }

    /// Do the plugin's work.
    fn execute(&self, _config: &mut ConfigStore) -> Result<()> {
        Ok(())
    }

    /// Clean up.
    fn teardown(&self, _config: &mut ConfigStore) -> Result<()> {
        Ok(())
    }

    /// Answer a web request, optionally producing an event.
    fn respond(
        &self,
        _config: &mut ConfigStore,
        _request: &Request,
    ) -> Result<(Payload, Option<Event>)> {
        Ok((Payload::text("\n"), None))
    }

    /// Extra text for the diagnostic transcript.
    fn describe_failure(&self, _config: &ConfigStore) -> Option<String> {
        None
    }
}

struct PluginInner {
    id: String,
    plugin: Arc<dyn Plugin>,
    requires: Vec<String>,
    defaults: Defaults,
    mergers: Mergers,
    docs: Docs,
    route: Option<String>,
    methods: Vec<RequestMethod>,
}

/// A loaded plugin with its declarations resolved.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<PluginInner>,
}

impl PluginHandle {
    /// Resolve all declarations of `plugin` once.
    pub fn new(id: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        let inner = PluginInner {
            id: id.into(),
            requires: plugin.requires().resolve(),
            defaults: plugin.defaults().resolve(),
            mergers: plugin.mergers().resolve(),
            docs: plugin.docs().resolve(),
            route: plugin.route(),
            methods: plugin.methods(),
            plugin,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The identifier this plugin was loaded under.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Resolved requirements.
    pub fn requires(&self) -> &[String] {
        &self.inner.requires
    }

    /// Resolved defaults.
    pub fn defaults(&self) -> &Defaults {
        &self.inner.defaults
    }

    /// Resolved merge functions.
    pub fn mergers(&self) -> &Mergers {
        &self.inner.mergers
    }

    /// Resolved documentation.
    pub fn docs(&self) -> &Docs {
        &self.inner.docs
    }

    /// Web route.
    pub fn route(&self) -> Option<&str> {
        self.inner.route.as_deref()
    }

    /// Accepted request methods.
    pub fn methods(&self) -> &[RequestMethod] {
        &self.inner.methods
    }

    /// Check if two handles refer to the same loaded instance.
    pub fn same_instance(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The underlying plugin.
    pub fn plugin(&self) -> &dyn Plugin {
        self.inner.plugin.as_ref()
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.inner.id)
            .field("requires", &self.inner.requires)
            .field("route", &self.inner.route)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Minimal;

    impl Plugin for Minimal {}

    struct Declaring {
        calls: Arc<AtomicUsize>,
    }

    impl Plugin for Declaring {
        fn requires(&self) -> Declared<Vec<String>> {
            let calls = self.calls.clone();
            Declared::dynamic(move || {
                calls.fetch_add(1, Ordering::Relaxed);
                vec!["base".to_string()]
            })
        }

        fn defaults(&self) -> Declared<Defaults> {
            Defaults::new().with("answer", 42).into()
        }

        fn route(&self) -> Option<String> {
            Some("/answer".into())
        }
    }

    #[test]
    fn test_minimal_plugin_defaults() {
        let handle = PluginHandle::new("minimal", Arc::new(Minimal));

        assert_eq!(handle.id(), "minimal");
        assert!(handle.requires().is_empty());
        assert!(handle.defaults().is_empty());
        assert!(handle.route().is_none());
        assert_eq!(handle.methods(), &[RequestMethod::Get]);
    }

    #[test]
    fn test_declarations_resolved_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = PluginHandle::new("declaring", Arc::new(Declaring { calls: calls.clone() }));

        assert_eq!(handle.requires(), &["base".to_string()]);
        let _ = handle.requires();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(handle.defaults().len(), 1);
        assert_eq!(handle.route(), Some("/answer"));
    }

    #[test]
    fn test_default_respond() {
        let mut store = ConfigStore::new();
        let (payload, event) = Minimal.respond(&mut store, &Request::get("/")).unwrap();
        assert_eq!(payload.body, "\n");
        assert!(event.is_none());
    }

    #[test]
    fn test_handle_clone_same_instance() {
        let handle = PluginHandle::new("minimal", Arc::new(Minimal));
        let other = handle.clone();
        assert!(handle.same_instance(&other));
        assert!(!handle.same_instance(&PluginHandle::new("minimal", Arc::new(Minimal))));
    }
}
