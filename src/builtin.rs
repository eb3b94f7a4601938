//! Built-in plugins.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use serde_json::{json, Value};

use crate::cli;
use crate::config::{ConfigStore, Defaults, Docs};
use crate::error::{Error, Result};
use crate::plugin::{Declared, Plugin};

/// Identifier of [`BasePlugin`].
pub const BASE_PLUGIN: &str = "base";

/// Default run-control file name.
pub const DEFAULT_RC_FILE: &str = "pipelinerc.toml";

const DOCS: &[(&str, &str)] = &[
    ("rc", "Path to run control file."),
    ("plugins", "Plugins to include."),
    ("debug", "Run in debugging mode."),
    ("debug_filename", "The path to the debug file."),
    ("verbose", "Print more output."),
    ("version", "Print version information."),
    (
        "host",
        "Which address to listen on, ie '0.0.0.0' for everyone or 'localhost' for yourself.",
    ),
    ("port", "The port to run the application on."),
    ("appname", "The name of the web application."),
    (
        "server_url",
        "The URL of the server without a trailing slash or port number, eg \
         'http://example.org'. Defaults to http:// followed by the host.",
    ),
    ("only_setup", "Stop after setup."),
];

fn doc(key: &str) -> &'static str {
    DOCS.iter()
        .find(|(k, _)| *k == key)
        .map(|(_, d)| *d)
        .unwrap_or("")
}

/// Version report printed by `--version` and added to diagnostic transcripts.
pub fn version_report() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), crate::VERSION)
}

/// Base functionality every application builds on.
///
/// Reads `version`, `port`, `rc`, `host` and `server_url`; writes `port`
/// (as an integer), `rc` (absolute), `server_url` (normalized) and
/// `only_setup` (when a version report was requested).
#[derive(Debug, Default)]
pub struct BasePlugin;

impl Plugin for BasePlugin {
    fn defaults(&self) -> Declared<Defaults> {
        Defaults::new()
            .with("rc", DEFAULT_RC_FILE)
            .with("plugins", json!([BASE_PLUGIN]))
            .with("debug", false)
            .with("debug_filename", "debug.txt")
            .with("verbose", false)
            .with("version", false)
            .with("host", "0.0.0.0")
            .with("port", 80)
            .with("appname", env!("CARGO_PKG_NAME"))
            .not_specified("server_url")
            .with("only_setup", false)
            .into()
    }

    fn docs(&self) -> Declared<Docs> {
        DOCS.iter()
            .map(|(k, d)| (k.to_string(), d.to_string()))
            .collect::<Docs>()
            .into()
    }

    fn configure(&self, command: Command) -> Command {
        command
            .arg(Arg::new("rc").long("rc").value_name("PATH").help(doc("rc")))
            .arg(cli::plugins_arg().help(doc("plugins")))
            .arg(
                Arg::new("debug")
                    .long("debug")
                    .action(ArgAction::SetTrue)
                    .help(doc("debug")),
            )
            .arg(
                Arg::new("debug_filename")
                    .long("debug-filename")
                    .value_name("PATH")
                    .help(doc("debug_filename")),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(ArgAction::SetTrue)
                    .help(doc("verbose")),
            )
            .arg(
                Arg::new("version")
                    .long("version")
                    .action(ArgAction::SetTrue)
                    .help(doc("version")),
            )
            .arg(Arg::new("host").long("host").help(doc("host")))
            .arg(Arg::new("port").long("port").help(doc("port")))
            .arg(Arg::new("appname").long("appname").help(doc("appname")))
            .arg(
                Arg::new("server_url")
                    .long("server-url")
                    .value_name("URL")
                    .help(doc("server_url")),
            )
            .arg(
                Arg::new("only_setup")
                    .long("only-setup")
                    .action(ArgAction::SetTrue)
                    .help(doc("only_setup")),
            )
    }

    fn setup(&self, config: &mut ConfigStore) -> Result<()> {
        if config.get_bool("version").unwrap_or(false) {
            println!("{}", version_report());
            config.set("only_setup", true);
            return Ok(());
        }

        let port = parse_port(config.get("port"))?;
        config.set("port", port);

        if let Some(rc) = config.get_str("rc") {
            let rc = absolute(rc)?;
            config.set("rc", rc.display().to_string());
        }

        let server_url = match config.get_str("server_url") {
            Some(url) => normalize_server_url(url),
            None => {
                let host = config.get_str("host").unwrap_or("localhost");
                let url = normalize_server_url(host);
                tracing::info!(server_url = %url, "server_url not specified, using host");
                url
            }
        };
        config.set("server_url", server_url);
        Ok(())
    }

    fn describe_failure(&self, _config: &ConfigStore) -> Option<String> {
        Some(format!("Version Information:\n\n{}\n\n", version_report()))
    }
}

fn parse_port(value: Option<&Value>) -> Result<u16> {
    let port = match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    port.ok_or_else(|| {
        Error::plugin(format!(
            "invalid port: {}",
            value.map(Value::to_string).unwrap_or_else(|| "missing".to_string())
        ))
    })
}

fn absolute(path: &str) -> Result<PathBuf> {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Strip a trailing slash and a trailing `:port`, and make sure the URL has
/// an `http://` or `https://` scheme.
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.strip_suffix('/').unwrap_or(url);

    let port_colon = url
        .match_indices(':')
        .rev()
        .find(|(i, _)| url[i + 1..].starts_with(|c: char| c.is_ascii_digit()))
        .map(|(i, _)| i);
    if let Some(i) = port_colon {
        url = &url[..i];
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Setting;
    use crate::plugin::PluginHandle;
    use std::sync::Arc;

    fn configured() -> ConfigStore {
        let base = PluginHandle::new(BASE_PLUGIN, Arc::new(BasePlugin));
        ConfigStore::merge_defaults(&[base]).unwrap()
    }

    #[test]
    fn test_defaults() {
        let store = configured();
        assert_eq!(store.get_str("host"), Some("0.0.0.0"));
        assert_eq!(store.get_i64("port"), Some(80));
        assert_eq!(store.get_str("debug_filename"), Some("debug.txt"));
        assert!(!store.contains_key("server_url"));
        assert_eq!(store.doc("port"), Some("The port to run the application on."));
    }

    #[test]
    fn test_setup_normalizes() {
        let mut store = configured();
        store
            .update(
                "cli",
                [
                    ("port", Setting::value("8080")),
                    ("rc", Setting::value("run.toml")),
                    ("server_url", Setting::value("example.org:8080/")),
                ],
            )
            .unwrap();

        BasePlugin.setup(&mut store).unwrap();

        assert_eq!(store.get_i64("port"), Some(8080));
        assert!(PathBuf::from(store.get_str("rc").unwrap()).is_absolute());
        assert_eq!(store.get_str("server_url"), Some("http://example.org"));
    }

    #[test]
    fn test_server_url_from_host() {
        let mut store = configured();
        store.set("host", "localhost");
        BasePlugin.setup(&mut store).unwrap();
        assert_eq!(store.get_str("server_url"), Some("http://localhost"));
    }

    #[test]
    fn test_invalid_port() {
        let mut store = configured();
        store.set("port", "eighty");
        let err = BasePlugin.setup(&mut store).unwrap_err();
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn test_version_requests_shutdown() {
        let mut store = configured();
        store.set("version", true);
        BasePlugin.setup(&mut store).unwrap();
        assert_eq!(store.get_bool("only_setup"), Some(true));
    }

    #[test]
    fn test_normalize_server_url() {
        assert_eq!(normalize_server_url("https://example.org/"), "https://example.org");
        assert_eq!(normalize_server_url("http://example.org:80"), "http://example.org");
        assert_eq!(normalize_server_url("example.org"), "http://example.org");
    }
}
