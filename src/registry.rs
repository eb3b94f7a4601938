//! Dependency-ordered, deduplicated plugin registry.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::plugin::PluginHandle;

/// Configuration for the plugin registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Whether `requires` declarations are followed.
    pub resolve_dependencies: bool,
    /// Maximum number of plugins allowed.
    pub max_plugins: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resolve_dependencies: true,
            max_plugins: 256,
        }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether dependencies are resolved.
    pub fn with_resolve_dependencies(mut self, resolve: bool) -> Self {
        self.resolve_dependencies = resolve;
        self
    }

    /// Set the maximum number of plugins.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Total plugins loaded.
    pub total: usize,
    /// Plugins exposing a web route.
    pub routed: usize,
    /// Plugins declaring at least one requirement.
    pub with_requirements: usize,
}

/// Ordered sequence of loaded plugins.
///
/// Every plugin appears after all of its requirements and no identifier
/// appears twice.
pub struct PluginRegistry {
    config: RegistryConfig,
    plugins: Vec<PluginHandle>,
}

/// Walk state shared across the whole resolution.
#[derive(Default)]
struct Walk {
    seen: HashSet<String>,
    resolving: Vec<String>,
}

impl PluginRegistry {
    /// Resolve `identifiers` through `loader` into a new registry.
    pub fn load<S: AsRef<str>>(
        loader: &dyn Loader,
        identifiers: &[S],
        config: RegistryConfig,
    ) -> Result<Self> {
        let mut registry = Self {
            config,
            plugins: Vec::new(),
        };
        let mut walk = Walk::default();
        let ids: Vec<String> = identifiers.iter().map(|s| s.as_ref().to_string()).collect();
        registry.load_all(loader, &ids, &mut walk)?;

        tracing::info!(
            plugins = ?registry.names(),
            "plugin registry built"
        );
        Ok(registry)
    }

    fn load_all(
        &mut self,
        loader: &dyn Loader,
        identifiers: &[String],
        walk: &mut Walk,
    ) -> Result<()> {
        for id in identifiers {
            if walk.seen.contains(id) {
                continue;
            }

            if let Some(pos) = walk.resolving.iter().position(|r| r == id) {
                let mut chain = walk.resolving[pos..].to_vec();
                chain.push(id.clone());
                return Err(Error::DependencyCycle { chain });
            }

            let handle = PluginHandle::new(id.clone(), loader.resolve(id)?);
            tracing::debug!(plugin = %id, requires = ?handle.requires(), "loaded plugin");

            if self.config.resolve_dependencies && !handle.requires().is_empty() {
                walk.resolving.push(id.clone());
                let requires = handle.requires().to_vec();
                let result = self.load_all(loader, &requires, walk);
                walk.resolving.pop();
                result?;
            }

            if self.plugins.len() >= self.config.max_plugins {
                return Err(Error::Registry(format!(
                    "registry full: max {} plugins",
                    self.config.max_plugins
                )));
            }

            walk.seen.insert(id.clone());
            self.plugins.push(handle);
        }
        Ok(())
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Plugins in execution order.
    pub fn plugins(&self) -> &[PluginHandle] {
        &self.plugins
    }

    /// Iterate plugins in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &PluginHandle> {
        self.plugins.iter()
    }

    /// Get a plugin by identifier.
    pub fn get(&self, id: &str) -> Option<PluginHandle> {
        self.plugins.iter().find(|p| p.id() == id).cloned()
    }

    /// Check if a plugin is loaded.
    pub fn contains(&self, id: &str) -> bool {
        self.plugins.iter().any(|p| p.id() == id)
    }

    /// Position of a plugin in execution order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.id() == id)
    }

    /// Identifiers in execution order.
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.id().to_string()).collect()
    }

    /// Plugins exposing a web route.
    pub fn routed(&self) -> Vec<PluginHandle> {
        self.plugins
            .iter()
            .filter(|p| p.route().is_some())
            .cloned()
            .collect()
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total: self.plugins.len(),
            routed: self.plugins.iter().filter(|p| p.route().is_some()).count(),
            with_requirements: self.plugins.iter().filter(|p| !p.requires().is_empty()).count(),
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config", &self.config)
            .field("plugins", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::loader::{LoaderConfig, PluginLoader};
    use crate::plugin::{Declared, Plugin};

    struct Requiring(Vec<&'static str>);

    impl Plugin for Requiring {
        fn requires(&self) -> Declared<Vec<String>> {
            self.0.iter().map(|s| s.to_string()).collect::<Vec<_>>().into()
        }
    }

    fn loader(graph: &[(&'static str, Vec<&'static str>)]) -> PluginLoader {
        let loader = PluginLoader::new(LoaderConfig::new().with_builtins(false));
        for (id, requires) in graph {
            let requires = requires.clone();
            loader.register(*id, move || Arc::new(Requiring(requires.clone())) as Arc<dyn Plugin>);
        }
        loader
    }

    struct Producing {
        requires: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl Plugin for Producing {
        fn requires(&self) -> Declared<Vec<String>> {
            let requires: Vec<String> = self.requires.iter().map(|s| s.to_string()).collect();
            let calls = self.calls.clone();
            Declared::dynamic(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                requires.clone()
            })
        }
    }

    #[test]
    fn test_produced_requirements_first() {
        let graph: [(&'static str, Vec<&'static str>); 3] =
            [("a", vec![]), ("b", vec!["a"]), ("c", vec!["b", "a"])];
        let loader = PluginLoader::new(LoaderConfig::new().with_builtins(false));
        let mut counters = Vec::new();
        for (id, requires) in graph {
            let calls = Arc::new(AtomicUsize::new(0));
            counters.push((id, calls.clone()));
            loader.register(id, move || {
                Arc::new(Producing {
                    requires: requires.clone(),
                    calls: calls.clone(),
                }) as Arc<dyn Plugin>
            });
        }

        let registry =
            PluginRegistry::load(&loader, &["c", "b", "c"], RegistryConfig::default()).unwrap();

        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        for (id, calls) in counters {
            assert_eq!(calls.load(Ordering::SeqCst), 1, "producer of {} called once", id);
        }
    }

    #[test]
    fn test_requirements_first() {
        let loader = loader(&[("a", vec![]), ("b", vec!["a"])]);
        let registry = PluginRegistry::load(&loader, &["b"], RegistryConfig::default()).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_shared_requirement_loaded_once() {
        let loader = loader(&[
            ("base", vec![]),
            ("x", vec!["base"]),
            ("y", vec!["base", "x"]),
        ]);
        let registry =
            PluginRegistry::load(&loader, &["y", "x", "y"], RegistryConfig::default()).unwrap();
        assert_eq!(registry.names(), vec!["base", "x", "y"]);
    }

    #[test]
    fn test_depth_first_left_to_right() {
        let loader = loader(&[
            ("a", vec![]),
            ("b", vec![]),
            ("c", vec!["b"]),
            ("d", vec!["a", "c"]),
        ]);
        let registry =
            PluginRegistry::load(&loader, &["d", "b"], RegistryConfig::default()).unwrap();
        assert_eq!(registry.names(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_dependencies_disabled() {
        let loader = loader(&[("a", vec![]), ("b", vec!["a"])]);
        let config = RegistryConfig::new().with_resolve_dependencies(false);
        let registry = PluginRegistry::load(&loader, &["b"], config).unwrap();
        assert_eq!(registry.names(), vec!["b"]);
    }

    #[test]
    fn test_cycle_detected() {
        let loader = loader(&[("a", vec!["b"]), ("b", vec!["c"]), ("c", vec!["a"])]);
        let result = PluginRegistry::load(&loader, &["a"], RegistryConfig::default());
        match result {
            Err(Error::DependencyCycle { chain }) => assert_eq!(chain, vec!["a", "b", "c", "a"]),
            other => panic!("expected cycle, got {:?}", other.map(|r| r.names())),
        }
    }

    #[test]
    fn test_self_requirement_is_cycle() {
        let loader = loader(&[("a", vec!["a"])]);
        let result = PluginRegistry::load(&loader, &["a"], RegistryConfig::default());
        assert!(matches!(result, Err(Error::DependencyCycle { .. })));
    }

    #[test]
    fn test_unknown_requirement() {
        let loader = loader(&[("a", vec!["ghost"])]);
        let result = PluginRegistry::load(&loader, &["a"], RegistryConfig::default());
        assert!(matches!(result, Err(Error::PluginNotFound(ref id)) if id == "ghost"));
    }

    #[test]
    fn test_max_plugins() {
        let loader = loader(&[("a", vec![]), ("b", vec![]), ("c", vec![])]);
        let config = RegistryConfig::new().with_max_plugins(2);
        let result = PluginRegistry::load(&loader, &["a", "b", "c"], config);
        assert!(matches!(result, Err(Error::Registry(_))));
    }

    #[test]
    fn test_registry_stats() {
        let loader = loader(&[("a", vec![]), ("b", vec!["a"])]);
        let registry = PluginRegistry::load(&loader, &["b"], RegistryConfig::default()).unwrap();
        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.with_requirements, 1);
        assert_eq!(stats.routed, 0);
        assert_eq!(registry.position("b"), Some(1));
    }
}
