//! Main entry point for the StudyLink call CLI
//!
//! Runs the call signaling core against in-process collaborators, either as
//! a scripted two-client demo or to decode a single wire message.

mod commands;
mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use studylink_call_core::{BusyPolicy, CallConfig};

use crate::commands::demo::Scenario;
use crate::logging::{LoggingConfig, parse_log_level, setup_logging};

#[derive(Debug, Parser)]
#[command(name = "studylink", version, about = "StudyLink call signaling tool")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "STUDYLINK_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Include file and line in log output
    #[arg(long, global = true)]
    file_info: bool,

    /// TOML file with call settings
    #[arg(short, long, global = true, env = "STUDYLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run two in-process clients through a call scenario
    Demo {
        #[arg(value_enum, default_value_t = Scenario::Accept)]
        scenario: Scenario,

        /// Override the ring timeout in seconds
        #[arg(long)]
        ring_timeout: Option<u64>,

        /// Answer a second caller with silence instead of a busy reject
        #[arg(long)]
        ignore_when_busy: bool,

        /// How long a connected call stays up, in seconds
        #[arg(long, default_value_t = 2)]
        hold: u64,
    },
    /// Decode a wire message and print it as JSON
    Decode {
        /// Raw message, e.g. 'CALL_REQUEST:{"callId":...}'
        message: String,
    },
}

/// Load settings from `path`, or the defaults when none is given
fn load_config(path: Option<&Path>) -> Result<CallConfig> {
    let Some(path) = path else {
        return Ok(CallConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: CallConfig = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let level = parse_log_level(&cli.log_level)?;
    setup_logging(
        LoggingConfig::new(level)
            .with_json(cli.json_logs)
            .with_file_info(cli.file_info),
    )?;

    match cli.command {
        Commands::Demo {
            scenario,
            ring_timeout,
            ignore_when_busy,
            hold,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(secs) = ring_timeout {
                config = config.with_ring_timeout(Duration::from_secs(secs));
            }
            if ignore_when_busy {
                config = config.with_busy_policy(BusyPolicy::Ignore);
            }
            config.validate()?;
            commands::demo::execute(scenario, config, Duration::from_secs(hold)).await
        }
        Commands::Decode { message } => commands::decode::execute(&message),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_demo_flags() {
        let cli = Cli::try_parse_from(["studylink", "demo", "media-failure", "--ring-timeout", "5"]).unwrap();
        match cli.command {
            Commands::Demo {
                scenario, ring_timeout, ..
            } => {
                assert_eq!(scenario, Scenario::MediaFailure);
                assert_eq!(ring_timeout, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_load_config_from_toml() {
        let path = std::env::temp_dir().join(format!("studylink-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "ring_timeout_secs = 20\nbusy_policy = \"ignore\"\n\n[local_user]\nid = \"alice\"\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.ring_timeout_secs, 20);
        assert_eq!(config.busy_policy, BusyPolicy::Ignore);
        assert_eq!(config.local_user.id.as_str(), "alice");

        assert!(load_config(None).unwrap().validate().is_ok());
    }
}
