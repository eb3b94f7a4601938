//! Resolution of plugin identifiers to plugin instances.

use std::sync::Arc;

use dashmap::DashMap;

use crate::builtin::{BasePlugin, BASE_PLUGIN};
use crate::error::{Error, Result};
use crate::plugin::Plugin;

/// Turns an identifier into a plugin instance.
///
/// Resolution must be deterministic: resolving the same identifier twice
/// yields equivalent plugins.
pub trait Loader: Send + Sync {
    /// Resolve `identifier`, failing with [`Error::PluginNotFound`] if unknown.
    fn resolve(&self, identifier: &str) -> Result<Arc<dyn Plugin>>;
}

/// Factory producing a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Configuration for the plugin loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Whether to pre-register the built-in plugins.
    pub builtins: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { builtins: true }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether built-in plugins are registered.
    pub fn with_builtins(mut self, builtins: bool) -> Self {
        self.builtins = builtins;
        self
    }
}

/// Loader backed by a table of identifier → factory.
pub struct PluginLoader {
    config: LoaderConfig,
    factories: DashMap<String, PluginFactory>,
}

impl PluginLoader {
    /// Create a new plugin loader.
    pub fn new(config: LoaderConfig) -> Self {
        let loader = Self {
            config,
            factories: DashMap::new(),
        };
        if loader.config.builtins {
            loader.register_default::<BasePlugin>(BASE_PLUGIN);
        }
        loader
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Register a factory, replacing any previous one for `identifier`.
    pub fn register<F>(&self, identifier: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        let identifier = identifier.into();
        if self.factories.insert(identifier.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(plugin = %identifier, "replacing registered plugin factory");
        }
    }

    /// Register a plugin type constructed with [`Default`].
    pub fn register_default<P>(&self, identifier: impl Into<String>)
    where
        P: Plugin + Default + 'static,
    {
        self.register(identifier, || Arc::new(P::default()) as Arc<dyn Plugin>);
    }

    /// Remove a factory.
    pub fn unregister(&self, identifier: &str) -> bool {
        self.factories.remove(identifier).is_some()
    }

    /// Check if an identifier is known.
    pub fn contains(&self, identifier: &str) -> bool {
        self.factories.contains_key(identifier)
    }

    /// All known identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl Loader for PluginLoader {
    fn resolve(&self, identifier: &str) -> Result<Arc<dyn Plugin>> {
        // Clone the factory out so the map shard is not held while it runs.
        let factory = self
            .factories
            .get(identifier)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::plugin_not_found(identifier))?;
        tracing::debug!(plugin = identifier, "resolved plugin");
        Ok(factory())
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("config", &self.config)
            .field("identifiers", &self.identifiers())
            .finish()
    }
}
