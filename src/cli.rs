//! Command-line interface definitions for portforwarded.
//!
//! Every flag can also come from a `PORTFORWARDED_*` environment variable;
//! flags win over the environment, and both win over the settings file.

use crate::config::MappingConfig;
use clap::Parser;
use std::path::PathBuf;

/// Run a process behind NAT with UPnP port mappings held for its lifetime.
///
/// Mappings are created before the process starts and removed after it
/// exits, or after Ctrl-C once the process has been stopped.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "portforwarded")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON settings file (default: appsettings.json if present).
    #[arg(short = 'c', long = "config", env = "PORTFORWARDED_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Executable to launch.
    #[arg(long = "file", env = "PORTFORWARDED_EXECUTABLE_FILE", value_name = "PROGRAM")]
    pub file: Option<String>,

    /// Working directory for the executable.
    #[arg(
        long = "working-directory",
        env = "PORTFORWARDED_WORKING_DIRECTORY",
        value_name = "DIR"
    )]
    pub working_directory: Option<PathBuf>,

    /// Arguments for the executable, as one whitespace-separated string.
    #[arg(
        long = "parameters",
        env = "PORTFORWARDED_PARAMETERS",
        value_name = "ARGS",
        allow_hyphen_values = true
    )]
    pub parameters: Option<String>,

    /// Port mapping (repeatable): protocol:local_port:public_port[@address].
    ///
    /// Replaces the mappings from the settings file when given.
    #[arg(
        short = 'm',
        long = "map",
        env = "PORTFORWARDED_MAP",
        value_name = "MAPPING",
        value_delimiter = ','
    )]
    pub mappings: Vec<MappingConfig>,

    /// Hold the mappings for a fixed interval instead of launching a process.
    #[arg(long = "no-launch", env = "PORTFORWARDED_NO_LAUNCH")]
    pub no_launch: bool,

    /// Seconds to wait for a gateway to answer discovery.
    #[arg(long = "discovery-timeout", value_name = "SECS")]
    pub discovery_timeout: Option<u64>,

    /// Seconds between asking the process to close and killing it.
    #[arg(long = "grace", value_name = "SECS")]
    pub grace: Option<u64>,

    /// Seconds to hold mappings in no-launch mode.
    #[arg(long = "hold", value_name = "SECS")]
    pub hold: Option<u64>,

    /// Lease requested for each mapping in seconds (0 = until removed).
    #[arg(long = "lease", value_name = "SECS")]
    pub lease: Option<u32>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
