//! Shared run-control store and the default-merging engine.
//!
//! Every loaded plugin declares defaults, optional per-key merge functions
//! and documentation. [`ConfigStore::merge_defaults`] folds them together in
//! registry order:
//!
//! - a key seen for the first time takes the declared value;
//! - a later [`Setting::NotSpecified`] leaves the current value untouched;
//! - otherwise the merge function registered for the key (last declaration
//!   wins) combines `(old, new)`, falling back to a plain overwrite.
//!
//! The same rule applies to every later overlay (run-control file, command
//! line) through [`ConfigStore::update`].

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::plugin::PluginHandle;

/// Reserved key holding the event produced by a web response.
pub const EVENT_KEY: &str = "event";

/// A declared configuration value, or the "not specified" sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    /// Defer to whatever value already exists.
    NotSpecified,
    /// A concrete value.
    Value(Value),
}

impl Setting {
    /// Wrap a concrete value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Check whether this is a concrete value.
    pub fn is_specified(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Borrow the concrete value, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::NotSpecified => None,
        }
    }
}

impl From<Value> for Setting {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Binary merge function `(old, new) -> merged`.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

/// Per-key merge functions declared by a plugin.
pub type Mergers = HashMap<String, MergeFn>;

/// Per-key documentation declared by a plugin.
pub type Docs = BTreeMap<String, String>;

/// Ordered default values declared by a plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Defaults {
    entries: Vec<(String, Setting)>,
}

impl Defaults {
    /// Create an empty set of defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a concrete default.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((key.into(), Setting::value(value)));
        self
    }

    /// Declare a key that must come from elsewhere.
    pub fn not_specified(mut self, key: impl Into<String>) -> Self {
        self.entries.push((key.into(), Setting::NotSpecified));
        self
    }

    /// Iterate entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Setting)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of declared entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for Defaults {
    type Item = (String, Setting);
    type IntoIter = std::vec::IntoIter<(String, Setting)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Setting)> for Defaults {
    fn from_iter<I: IntoIterator<Item = (String, Setting)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Ready-made merge functions.
pub mod merge {
    use super::*;

    fn as_list<'a>(value: &'a Value, key_hint: &str) -> Result<&'a Vec<Value>> {
        value.as_array().ok_or_else(|| {
            Error::plugin(format!("{} merge expects a list, got {}", key_hint, value))
        })
    }

    /// New items first, then the old ones: `new + old`.
    pub fn prepend() -> MergeFn {
        Arc::new(|old: &Value, new: &Value| -> Result<Value> {
            let mut merged = as_list(new, "prepend")?.clone();
            merged.extend(as_list(old, "prepend")?.iter().cloned());
            Ok(Value::Array(merged))
        })
    }

    /// Old items first, then the new ones: `old + new`.
    pub fn append() -> MergeFn {
        Arc::new(|old: &Value, new: &Value| -> Result<Value> {
            let mut merged = as_list(old, "append")?.clone();
            merged.extend(as_list(new, "append")?.iter().cloned());
            Ok(Value::Array(merged))
        })
    }

    /// Shallow object merge where keys from `new` replace keys from `old`.
    pub fn union() -> MergeFn {
        Arc::new(|old: &Value, new: &Value| -> Result<Value> {
            match (old, new) {
                (Value::Object(old), Value::Object(new)) => {
                    let mut merged = old.clone();
                    for (k, v) in new {
                        merged.insert(k.clone(), v.clone());
                    }
                    Ok(Value::Object(merged))
                }
                _ => Err(Error::plugin("union merge expects two objects")),
            }
        })
    }
}

/// The single shared run-control store of a pipeline.
#[derive(Clone, Default)]
pub struct ConfigStore {
    values: BTreeMap<String, Setting>,
    mergers: Mergers,
    docs: Docs,
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh store from the defaults of `plugins`, in order.
    pub fn merge_defaults(plugins: &[PluginHandle]) -> Result<Self> {
        let mut store = Self::new();
        for plugin in plugins {
            store.apply_plugin(plugin)?;
        }
        tracing::debug!(keys = store.len(), "merged plugin defaults");
        Ok(store)
    }

    /// Fold one plugin's merge functions, docs and defaults into this store.
    ///
    /// Merge functions are registered before the defaults are applied, so a
    /// plugin's own merge function already governs its defaults.
    pub fn apply_plugin(&mut self, plugin: &PluginHandle) -> Result<()> {
        self.add_mergers(plugin.mergers().clone());
        self.add_docs(plugin.docs().clone());
        self.update(plugin.id(), plugin.defaults().clone())
    }

    /// Apply `entries` with merge semantics. `source` names the origin for errors.
    pub fn update<I, K>(&mut self, source: &str, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Setting)>,
        K: Into<String>,
    {
        for (key, incoming) in entries {
            let key = key.into();
            self.merge_value(source, key, incoming)?;
        }
        Ok(())
    }

    fn merge_value(&mut self, source: &str, key: String, incoming: Setting) -> Result<()> {
        let Setting::Value(new) = incoming else {
            // Sentinel never replaces a value and never creates an entry.
            return Ok(());
        };

        let merged = match self.values.get(&key) {
            Some(Setting::Value(old)) => match self.mergers.get(&key) {
                Some(merge) => merge(old, &new).map_err(|e| Error::merge_failed(source, &key, e))?,
                None => new,
            },
            Some(Setting::NotSpecified) | None => new,
        };

        self.values.insert(key, Setting::Value(merged));
        Ok(())
    }

    /// Register merge functions; later registrations replace earlier ones.
    pub fn add_mergers(&mut self, mergers: Mergers) {
        self.mergers.extend(mergers);
    }

    /// Register documentation; later registrations replace earlier ones.
    pub fn add_docs(&mut self, docs: Docs) {
        self.docs.extend(docs);
    }

    /// Get a concrete value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).and_then(Setting::as_value)
    }

    /// Get the raw setting, which may be the sentinel.
    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.values.get(key)
    }

    /// Get a boolean value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Get a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Get an integer value.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Check if the key exists, sentinel included.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Check if the key holds a concrete value.
    pub fn is_specified(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Overwrite a value without consulting merge functions.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), Setting::value(value));
    }

    /// Overwrite a setting, sentinel included.
    pub fn set_setting(&mut self, key: impl Into<String>, setting: Setting) {
        self.values.insert(key.into(), setting);
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) -> Option<Setting> {
        self.values.remove(key)
    }

    /// The event delivered by the last web response, if still present.
    pub fn event(&self) -> Option<&Value> {
        self.get(EVENT_KEY)
    }

    /// Documentation for a key.
    pub fn doc(&self, key: &str) -> Option<&str> {
        self.docs.get(key).map(String::as_str)
    }

    /// Check whether a merge function is registered for a key.
    pub fn has_merger(&self, key: &str) -> bool {
        self.mergers.contains_key(key)
    }

    /// All keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Concrete values in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values
            .iter()
            .filter_map(|(k, v)| v.as_value().map(|v| (k.as_str(), v)))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Apply a TOML or JSON run-control file, chosen by extension.
    #[cfg(feature = "serde")]
    pub fn update_from_file(&mut self, path: &std::path::Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");

        let table: serde_json::Map<String, Value> = if is_json {
            serde_json::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))?
        } else {
            toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))?
        };

        let source = path.display().to_string();
        self.update(&source, table.into_iter().map(|(k, v)| (k, Setting::Value(v))))
    }

    /// Human-readable dump, one `key: value` line per entry.
    pub fn pformat(&self) -> String {
        let mut out = String::new();
        for (key, setting) in &self.values {
            let _ = match setting {
                Setting::Value(v) => writeln!(out, "{}: {}", key, v),
                Setting::NotSpecified => writeln!(out, "{}: NotSpecified", key),
            };
        }
        out
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("values", &self.values)
            .field("mergers", &self.mergers.keys().collect::<Vec<_>>())
            .field("docs", &self.docs.len())
            .finish()
    }
}
