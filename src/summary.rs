//! Reference summary of every plugin's configuration keys.

use serde_json::Value;
use textwrap::Options;

use crate::config::ConfigStore;
use crate::error::Result;
use crate::loader::Loader;
use crate::registry::{PluginRegistry, RegistryConfig};

/// Text used for keys without documentation.
pub const NO_DOC: &str = "No docstring provided.";

/// Default maximum length of a rendered default before it is elided.
pub const MAX_DEFAULT: usize = 2000;

const WIDTH: usize = 80;
const INDENT: &str = "    ";

/// Render a reStructuredText field-list summary for each identifier.
///
/// Each plugin is loaded alone, without its requirements, and its defaults
/// are merged into an isolated store. Every key becomes
/// `:key: doc, *default:* value.` wrapped at 80 columns. Defaults whose
/// rendering exceeds `max_default` characters are replaced by their kind.
pub fn summarize_docs<S: AsRef<str>>(
    loader: &dyn Loader,
    identifiers: &[S],
    header_sep: char,
    max_default: usize,
) -> Result<String> {
    let config = RegistryConfig::new().with_resolve_dependencies(false);
    let options = Options::new(WIDTH).subsequent_indent(INDENT);
    let mut sections = Vec::with_capacity(identifiers.len());

    for id in identifiers {
        let id = id.as_ref();
        let registry = PluginRegistry::load(loader, &[id], config.clone())?;
        let store = ConfigStore::merge_defaults(registry.plugins())?;

        let underline = header_sep.to_string().repeat(id.chars().count());
        let mut section = format!("{}\n{}\n", id, underline);
        for (key, value) in store.iter() {
            let line = format!(
                ":{}: {}, *default:* {}.",
                key,
                store.doc(key).unwrap_or(NO_DOC),
                render_default(value, max_default)
            );
            section.push_str(&textwrap::wrap(&line, &options).join("\n"));
            section.push('\n');
        }
        sections.push(section);
    }

    Ok(sections.join("\n\n\n"))
}

fn render_default(value: &Value, max_default: usize) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() <= max_default {
        return rendered;
    }
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("{} instance", kind)
}
