//! Command-line interface handling for the Horizon replication server.
//!
//! Every option overrides a value from the configuration file.

use crate::config::AppConfig;
use clap::{value_parser, Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Network ticks per second
    pub tick_rate: Option<f64>,
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Number of simulated objects
    pub objects: Option<usize>,
    /// Number of simulated clients
    pub clients: Option<usize>,
}

impl CliArgs {
    pub fn command() -> Command {
        Command::new("Horizon Replication Server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Replication graph host driving a simulated world")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("tick-rate")
                    .short('t')
                    .long("tick-rate")
                    .value_name("HZ")
                    .help("Network ticks per second")
                    .value_parser(value_parser!(f64)),
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
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("objects")
                    .short('o')
                    .long("objects")
                    .value_name("COUNT")
                    .help("Number of simulated replicated objects")
                    .value_parser(value_parser!(usize)),
            )
            .arg(
                Arg::new("clients")
                    .long("clients")
                    .value_name("COUNT")
                    .help("Number of simulated client connections")
                    .value_parser(value_parser!(usize)),
            )
    }

    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&Self::command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            tick_rate: matches.get_one::<f64>("tick-rate").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            objects: matches.get_one::<usize>("objects").copied(),
            clients: matches.get_one::<usize>("clients").copied(),
        }
    }

    /// Writes the overrides into a loaded configuration.
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(rate) = self.tick_rate {
            config.replication.general.server_tick_rate = rate;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
        if let Some(objects) = self.objects {
            config.server.simulated_objects = objects;
        }
        if let Some(clients) = self.clients {
            config.server.simulated_clients = clients;
        }
    }
}
