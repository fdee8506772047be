//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Syncline - clock synchronization and coordination for capture devices
#[derive(Parser, Debug)]
#[command(
    name = "syncline",
    author,
    version,
    about = "Multi-device clock synchronization controller",
    long_about = "Aligns the clocks of remote capture devices with this controller.\n\n\
                  Estimates per-device offsets from round-trip probes, keeps devices in sync,\n\
                  broadcasts coordination events and verifies alignment with calibration triggers."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "SYNCLINE_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "SYNCLINE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller against the configured (simulated) fleet
    Run(RunArgs),

    /// Validate a configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),

    /// Sync the fleet, then run a calibration session
    Calibrate(CalibrateArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "syncline.toml", env = "SYNCLINE_CONFIG")]
    pub config: PathBuf,

    /// Run time in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "30", env = "SYNCLINE_DURATION")]
    pub duration: f64,

    /// Metrics server port, overrides the configuration (0 = disabled)
    #[arg(long, env = "SYNCLINE_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Override the RNG seed used for jitter and simulation noise
    #[arg(long, env = "SYNCLINE_SEED")]
    pub seed: Option<u64>,

    /// Session name attached to the recording-start event
    #[arg(long, default_value = "syncline-session")]
    pub session_name: String,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "syncline.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "syncline.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show per-device simulation profiles
    #[arg(long)]
    pub devices: bool,
}

#[derive(Parser, Debug)]
pub struct CalibrateArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "syncline.toml", env = "SYNCLINE_CONFIG")]
    pub config: PathBuf,

    /// Number of trigger events, overrides the configuration
    #[arg(long)]
    pub events: Option<usize>,

    /// Run the three-marker quick check instead of a full session
    #[arg(long, conflicts_with = "events")]
    pub quick: bool,

    /// Skip the initial sync (measures raw, uncorrected clock error)
    #[arg(long)]
    pub no_sync: bool,

    /// Output the analysis as JSON
    #[arg(long)]
    pub json: bool,

    /// Override the RNG seed
    #[arg(long, env = "SYNCLINE_SEED")]
    pub seed: Option<u64>,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["syncline", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, PathBuf::from("syncline.toml"));
        assert_eq!(args.duration, 30.0);
        assert!(args.metrics_port.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["syncline", "validate", "-c", "a.json", "-vv", "--json"]);
        assert_eq!(cli.verbose, 2);
        let Commands::Validate(args) = cli.command else {
            panic!("expected validate");
        };
        assert!(args.json);
        assert_eq!(args.config, PathBuf::from("a.json"));
    }

    #[test]
    fn test_quick_conflicts_with_events() {
        let parsed = Cli::try_parse_from(["syncline", "calibrate", "--quick", "--events", "4"]);
        assert!(parsed.is_err());
    }
}
