//! Error types for registry, configuration and pipeline operations.

use thiserror::Error;

use crate::lifecycle::Stage;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, configuring or running plugins.
#[derive(Error, Debug)]
pub enum Error {
    /// Identifier could not be resolved to a plugin.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Circular `requires` declarations.
    #[error("dependency cycle: {}", .chain.join(" -> "))]
    DependencyCycle {
        /// Identifiers along the cycle, first and last are the same.
        chain: Vec<String>,
    },

    /// A merge function failed while combining values.
    #[error("merging '{key}' from {plugin} failed: {source}")]
    Merge {
        /// Plugin whose default was being merged.
        plugin: String,
        /// Configuration key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A plugin failed during a lifecycle stage.
    #[error("{stage} failed in {plugin}: {source}")]
    Stage {
        /// Stage that was running.
        stage: Stage,
        /// Plugin that failed.
        plugin: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A plugin failed while producing a web response.
    #[error("response from {plugin} failed: {source}")]
    Respond {
        /// Plugin that failed.
        plugin: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Pipeline is in the wrong state for the operation.
    #[error("invalid pipeline state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Failure raised by a plugin's own code.
    #[error("{0}")]
    Plugin(String),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Command-line error.
    #[error(transparent)]
    Cli(#[from] clap::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Run-control file parse error.
    #[cfg(feature = "serde")]
    #[error("run control parse error: {0}")]
    ConfigParse(String),
}

impl Error {
    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound(name.into())
    }

    /// Create a plugin failure, for use inside plugin operations.
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Create a merge error.
    pub fn merge_failed(plugin: impl Into<String>, key: impl Into<String>, source: Error) -> Self {
        Self::Merge {
            plugin: plugin.into(),
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Create a stage error.
    pub fn stage_failed(stage: Stage, plugin: impl Into<String>, source: Error) -> Self {
        Self::Stage {
            stage,
            plugin: plugin.into(),
            source: Box::new(source),
        }
    }

    /// Create a response error.
    pub fn respond_failed(plugin: impl Into<String>, source: Error) -> Self {
        Self::Respond {
            plugin: plugin.into(),
            source: Box::new(source),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns true if the error happened before any stage ran.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::PluginNotFound(_) | Self::DependencyCycle { .. } | Self::Registry(_)
        )
    }

    /// The failing plugin, when the error is attributed to one.
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            Self::Merge { plugin, .. }
            | Self::Stage { plugin, .. }
            | Self::Respond { plugin, .. } => Some(plugin),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::plugin_not_found("my-plugin");
        assert_eq!(err.to_string(), "plugin not found: my-plugin");

        let err = Error::DependencyCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");

        let err = Error::stage_failed(Stage::Execute, "b", Error::plugin("boom"));
        assert_eq!(err.to_string(), "execute failed in b: boom");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::plugin_not_found("test").is_load_error());
        assert!(!Error::plugin("test").is_load_error());

        let err = Error::merge_failed("a", "x", Error::plugin("bad"));
        assert_eq!(err.plugin_name(), Some("a"));
        assert_eq!(Error::plugin("x").plugin_name(), None);
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as _;

        let err = Error::respond_failed("web", Error::plugin("no body"));
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("no body"));
    }
}
