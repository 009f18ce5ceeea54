use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};

use offsetgate_core::config::OPTION_NAMES;
use offsetgate_core::{Error, Result};

/// Prefix of environment variables carrying options, e.g. `OFFSETGATE_STREAM_NAME`.
const ENV_PREFIX: &str = "OFFSETGATE_";

pub(super) fn root_cli() -> Command {
    Command::new("offsetgate")
        .about("Plans rate-limited batch boundaries over a partitioned log and tracks committed progress")
        .arg(
            Arg::new("option")
                .long("option")
                .short('o')
                .help("Configuration option as key=value, e.g. streamName=telemetry")
                .action(ArgAction::Append)
                .value_parser(parse_option),
        )
        .arg(
            Arg::new("partitions")
                .long("partitions")
                .help("Partitions of the simulated upstream")
                .default_value("4")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("produce-per-tick")
                .long("produce-per-tick")
                .help("Messages appended to every simulated partition per trigger interval")
                .default_value("250")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .help("Batch trigger interval")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("batches")
                .long("batches")
                .help("Stop after this many triggers, runs until interrupted otherwise")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("allowed-rate")
                .long("allowed-rate")
                .help("Publish a fixed backpressure rate, switching the limiter to dynamic mode")
                .value_parser(clap::value_parser!(f64)),
        )
}

fn parse_option(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty option name in {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Demo knobs for the simulated collaborators.
#[derive(Debug, Clone)]
pub(super) struct DemoArgs {
    pub partitions: u32,
    pub produce_per_tick: i64,
    pub interval: Duration,
    pub batches: Option<usize>,
    pub allowed_rate: Option<f64>,
}

impl DemoArgs {
    pub(super) fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            partitions: matches.get_one::<u32>("partitions").copied().unwrap_or(4),
            produce_per_tick: matches
                .get_one::<i64>("produce-per-tick")
                .copied()
                .unwrap_or(250),
            interval: Duration::from_millis(
                matches.get_one::<u64>("interval-ms").copied().unwrap_or(1000),
            ),
            batches: matches.get_one::<usize>("batches").copied(),
            allowed_rate: matches.get_one::<f64>("allowed-rate").copied(),
        }
    }
}

/// Environment options first, `--option` arguments override them.
pub(super) fn collect_options(
    matches: &ArgMatches,
    env_vars: impl IntoIterator<Item = (String, String)>,
) -> Result<Vec<(String, String)>> {
    let mut options: Vec<(String, String)> = env_vars
        .into_iter()
        .filter_map(|(name, value)| {
            let key = name.strip_prefix(ENV_PREFIX)?;
            option_for_env_key(key).map(|option| (option.to_string(), value))
        })
        .collect();

    if let Some(cli) = matches.get_many::<(String, String)>("option") {
        options.extend(cli.cloned());
    }
    if options.is_empty() {
        return Err(Error::Config(
            "no options given, pass --option key=value or OFFSETGATE_<KEY> variables".to_string(),
        ));
    }
    Ok(options)
}

/// `STREAM_NAME` -> `streamName`, for known options only.
fn option_for_env_key(key: &str) -> Option<&'static str> {
    OPTION_NAMES
        .iter()
        .copied()
        .find(|option| to_env_key(option) == key)
}

fn to_env_key(option: &str) -> String {
    let mut key = String::with_capacity(option.len() + 4);
    for c in option.chars() {
        if c.is_ascii_uppercase() {
            key.push('_');
        }
        key.push(c.to_ascii_uppercase());
    }
    key
}
