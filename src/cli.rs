//! Command-line surface assembled from every plugin's options.
//!
//! Plugins add options through [`crate::Plugin::configure`]; option ids are
//! configuration keys. Options carry no defaults, so only values the user
//! actually typed become overrides and the merge engine's sentinel rule is
//! never masked.

use std::ffi::OsString;

use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;

use crate::config::Setting;
use crate::error::Result;
use crate::plugin::PluginHandle;

/// Id of the option selecting which plugins to load.
pub const PLUGINS: &str = "plugins";

/// The `--plugins` option, taking several values or a comma-separated list.
/// Repeated occurrences accumulate.
pub fn plugins_arg() -> Arg {
    Arg::new(PLUGINS)
        .long(PLUGINS)
        .num_args(1..)
        .value_delimiter(',')
        .action(ArgAction::Append)
        .value_name("ID")
        .help("Plugins to include.")
}

/// Plugin identifiers given with `--plugins`, read before any plugin is loaded.
///
/// Only the `--plugins` occurrences and their values are handed to a command
/// declaring [`plugins_arg`], so options of plugins that are not loaded yet
/// are left alone. Returns an empty list when the option is absent.
pub fn requested_plugins(args: &[OsString]) -> Result<Vec<String>> {
    let long = format!("--{}", PLUGINS);
    let inline = format!("--{}=", PLUGINS);
    let mut selected: Vec<OsString> = args.iter().take(1).cloned().collect();
    let mut collecting = false;

    for arg in args.iter().skip(1) {
        let text = arg.to_string_lossy();
        if text == "--" {
            break;
        }
        if text == long || text.starts_with(&inline) {
            selected.push(arg.clone());
            collecting = text == long;
        } else if collecting && !text.starts_with('-') {
            selected.push(arg.clone());
        } else {
            collecting = false;
        }
    }
    if selected.len() < 2 {
        return Ok(Vec::new());
    }

    let matches = Command::new(PLUGINS)
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(plugins_arg())
        .try_get_matches_from(selected)?;
    Ok(matches
        .get_many::<String>(PLUGINS)
        .map(|ids| ids.filter(|id| !id.is_empty()).cloned().collect())
        .unwrap_or_default())
}

/// Build the application command from `plugins`, in registry order.
///
/// The command always accepts [`plugins_arg`]. A later plugin declaring an
/// option with an id already present replaces it. An option whose flag
/// collides with a different id is skipped.
pub fn build_command(name: impl Into<String>, plugins: &[PluginHandle]) -> Command {
    let mut command = Command::new(name.into())
        .disable_version_flag(true)
        .arg(plugins_arg());

    for plugin in plugins {
        let contributed = plugin
            .plugin()
            .configure(Command::new(plugin.id().to_string()));
        for arg in contributed.get_arguments() {
            command = merge_arg(command, arg.clone(), plugin.id());
        }
    }
    command
}

fn merge_arg(command: Command, arg: Arg, plugin: &str) -> Command {
    let id = arg.get_id().as_str().to_string();

    if command.get_arguments().any(|a| a.get_id() == arg.get_id()) {
        tracing::debug!(plugin, option = %id, "option redefined");
        return command.mut_arg(id, move |_| arg);
    }

    let clash = command.get_arguments().find(|a| {
        (arg.get_long().is_some() && a.get_long() == arg.get_long())
            || (arg.get_short().is_some() && a.get_short() == arg.get_short())
    });
    if let Some(existing) = clash {
        tracing::warn!(
            plugin,
            option = %id,
            existing = %existing.get_id(),
            "option flag already taken, skipping"
        );
        return command;
    }

    command.arg(arg)
}

/// Parse `args` (program name first) against `command`.
///
/// Help and version requests come back as [`crate::Error::Cli`].
pub fn parse<I, T>(command: &mut Command, args: I) -> Result<ArgMatches>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Ok(command.try_get_matches_from_mut(args)?)
}

/// Values given explicitly on the command line, keyed by option id.
///
/// Flags become booleans, counters become integers, multi-valued options
/// become lists of strings and everything else a single string.
pub fn overrides(command: &Command, matches: &ArgMatches) -> Vec<(String, Setting)> {
    let mut out = Vec::new();

    for arg in command.get_arguments() {
        let id = arg.get_id().as_str();
        if matches.value_source(id) != Some(ValueSource::CommandLine) {
            continue;
        }

        let value = match arg.get_action() {
            ArgAction::SetTrue => Value::Bool(true),
            ArgAction::SetFalse => Value::Bool(false),
            ArgAction::Count => Value::from(matches.get_count(id)),
            ArgAction::Help | ArgAction::HelpShort | ArgAction::HelpLong | ArgAction::Version => {
                continue
            }
            action => {
                let raw: Vec<String> = matches
                    .get_raw(id)
                    .map(|values| values.map(|v| v.to_string_lossy().into_owned()).collect())
                    .unwrap_or_default();
                let many = matches!(action, ArgAction::Append)
                    || arg.get_num_args().map_or(false, |range| range.max_values() > 1);

                if many {
                    Value::Array(raw.into_iter().map(Value::String).collect())
                } else {
                    match raw.into_iter().next() {
                        Some(v) => Value::String(v),
                        None => continue,
                    }
                }
            }
        };
        out.push((id.to_string(), Setting::Value(value)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::plugin::Plugin;

    struct Flags;

    impl Plugin for Flags {
        fn configure(&self, command: Command) -> Command {
            command
                .arg(Arg::new("debug").long("debug").action(ArgAction::SetTrue))
                .arg(Arg::new("verbose").short('v').action(ArgAction::Count))
                .arg(Arg::new("name").long("name"))
                .arg(Arg::new("includes").long("includes").num_args(1..))
        }
    }

    struct Redefines;

    impl Plugin for Redefines {
        fn configure(&self, command: Command) -> Command {
            command
                .arg(Arg::new("name").long("name").help("replaced"))
                .arg(Arg::new("other").long("debug"))
        }
    }

    fn command() -> Command {
        build_command(
            "app",
            &[
                PluginHandle::new("flags", Arc::new(Flags)),
                PluginHandle::new("redefines", Arc::new(Redefines)),
            ],
        )
    }

    #[test]
    fn test_arguments_merged() {
        let command = command();
        let ids: Vec<_> = command.get_arguments().map(|a| a.get_id().to_string()).collect();

        assert_eq!(ids, vec!["plugins", "debug", "verbose", "name", "includes"]);
        let name = command.get_arguments().find(|a| a.get_id() == "name").unwrap();
        assert_eq!(name.get_help().map(|h| h.to_string()), Some("replaced".to_string()));
    }

    #[test]
    fn test_only_explicit_values() {
        let mut command = command();
        let matches = parse(&mut command, ["app", "--name", "x"]).unwrap();
        let values = overrides(&command, &matches);

        assert_eq!(values, vec![("name".to_string(), Setting::value("x"))]);
    }

    #[test]
    fn test_value_shapes() {
        let mut command = command();
        let matches = parse(
            &mut command,
            ["app", "--debug", "-vv", "--includes", "a", "b"],
        )
        .unwrap();
        let values = overrides(&command, &matches);

        assert!(values.contains(&("debug".to_string(), Setting::value(true))));
        assert!(values.contains(&("verbose".to_string(), Setting::value(2))));
        assert!(values.contains(&("includes".to_string(), Setting::value(json!(["a", "b"])))));
    }

    #[test]
    fn test_plugins_option_without_contributor() {
        let mut command = command();
        let matches = parse(&mut command, ["app", "--plugins=a,b", "--name", "x"]).unwrap();
        let values = overrides(&command, &matches);

        assert!(values.contains(&("plugins".to_string(), Setting::value(json!(["a", "b"])))));
    }

    #[test]
    fn test_requested_plugins() {
        let args = |list: &[&str]| list.iter().map(OsString::from).collect::<Vec<_>>();

        assert!(requested_plugins(&args(&["app", "--debug"])).unwrap().is_empty());
        assert_eq!(
            requested_plugins(&args(&["app", "--debug", "--plugins", "a", "b", "--rc", "x"]))
                .unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            requested_plugins(&args(&["app", "--plugins=a,b", "--unknown"])).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            requested_plugins(&args(&["app", "--plugins", "a", "--plugins", "c,d"])).unwrap(),
            vec!["a", "c", "d"]
        );
        assert!(requested_plugins(&args(&["app", "--", "--plugins", "a"]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_help_is_cli_error() {
        let mut command = command();
        let err = parse(&mut command, ["app", "--help"]).unwrap_err();
        assert!(matches!(err, crate::Error::Cli(ref e) if !e.use_stderr()));
    }
}
