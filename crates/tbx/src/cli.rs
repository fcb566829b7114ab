//! Command-line interface of the `tbx` launcher.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "tbx.toml";

/// Command line arguments. Everything except the config path overrides the
/// matching setting from the configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Plugin directory, overriding `host.plugin_directory`
    pub plugin_dir: Option<PathBuf>,
    /// Log level, overriding `logging.level`
    pub log_level: Option<String>,
    /// Force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses the process arguments, exiting with a usage message if they
    /// are malformed.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list; the first item is the program name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = command().try_get_matches_from(args)?;
        Ok(Self::from_matches(&matches))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            plugin_dir: matches.get_one::<String>("plugin-dir").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

/// The clap command describing the launcher.
pub fn command() -> Command {
    Command::new("tbx")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Loads Tbx plugins from a directory and runs the app they provide")
        .arg(
            Arg::new("plugin-dir")
                .value_name("PLUGIN_DIR")
                .help("Directory holding one subdirectory per plugin"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}
