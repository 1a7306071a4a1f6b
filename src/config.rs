//! Run settings
//!
//! Settings come in three layers, later layers winning: an optional JSON file,
//! environment variables and command-line flags (the last two both through
//! [`crate::cli::Cli`]).
//!
//! # Example
//! ```rust,no_run
//! use portforwarded::Settings;
//!
//! let settings = Settings::load("appsettings.json").expect("Failed to load");
//! if let Err(problems) = settings.validate() {
//!     for problem in problems {
//!         eprintln!("{}", problem);
//!     }
//! }
//! ```

use crate::cli::Cli;
use crate::gateway::IpProtocol;
use crate::supervisor::LaunchSpec;
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Settings file read when none is named on the command line
pub const DEFAULT_SETTINGS_FILE: &str = "appsettings.json";

/// Settings for one supervised run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Process to launch while the mappings are up
    pub executable: ExecutableSettings,
    /// Ports to map, in order
    #[serde(alias = "upnp")]
    pub mappings: Vec<MappingConfig>,
    /// Hold the mappings for a fixed interval instead of launching anything
    #[serde(alias = "testmode", alias = "testMode")]
    pub no_launch_mode: bool,
    /// Bound on gateway discovery
    pub discovery_timeout_seconds: u64,
    /// How long a child gets between the close request and the kill
    pub shutdown_grace_seconds: u64,
    /// How long mappings are held in no-launch mode
    pub no_launch_hold_seconds: u64,
    /// Lease requested for each mapping (0 = until removed)
    pub lease_seconds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            executable: ExecutableSettings::default(),
            mappings: Vec::new(),
            no_launch_mode: false,
            discovery_timeout_seconds: 5,
            shutdown_grace_seconds: 5,
            no_launch_hold_seconds: 5,
            lease_seconds: 0,
        }
    }
}

/// The `executable` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutableSettings {
    /// Program to run
    pub file: Option<String>,
    /// Directory the program runs in
    #[serde(alias = "workingdirectory")]
    pub working_directory: Option<PathBuf>,
    /// Arguments, either one whitespace-separated string or a list
    pub parameters: Option<Parameters>,
}

/// Program arguments as written in the settings file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Parameters {
    /// Single string, split on whitespace
    Line(String),
    /// Already split
    List(Vec<String>),
}

impl Parameters {
    /// Arguments as passed to the program
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Parameters::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Parameters::List(list) => list.clone(),
        }
    }
}

/// One configured mapping; the local address may be left to discovery
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MappingConfig {
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Local host address; defaults to the address on the route to the gateway
    #[serde(
        default,
        alias = "localIPAddress",
        alias = "localIpAddress",
        deserialize_with = "empty_as_none"
    )]
    pub local_address: Option<IpAddr>,
    /// Port on the local host
    pub local_port: u16,
    /// Port opened on the gateway
    pub public_port: u16,
}

/// Accepts `"protocol:local:public"` with an optional `@address` suffix,
/// e.g. `tcp:8080:80@192.168.1.10`
impl FromStr for MappingConfig {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ports, address) = match s.split_once('@') {
            Some((ports, address)) => (ports, Some(address)),
            None => (s, None),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        if parts.len() != 3 {
            return Err(format!(
                "invalid mapping '{}' (expected protocol:local_port:public_port[@address])",
                s
            ));
        }

        let protocol = parts[0].parse::<IpProtocol>()?;
        let local_port = parts[1]
            .parse::<u16>()
            .map_err(|e| format!("invalid local port '{}': {}", parts[1], e))?;
        let public_port = parts[2]
            .parse::<u16>()
            .map_err(|e| format!("invalid public port '{}': {}", parts[2], e))?;
        let local_address = address
            .map(|a| {
                a.parse::<IpAddr>()
                    .map_err(|e| format!("invalid address '{}': {}", a, e))
            })
            .transpose()?;

        Ok(Self {
            protocol,
            local_address,
            local_port,
            public_port,
        })
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<IpAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

impl Settings {
    /// Load settings from a JSON file
    ///
    /// A missing or empty file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("Failed to read {}: {}", path.display(), e))
        })?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data).map_err(|e| {
            Error::ConfigInvalid(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Resolve all layers for a command line
    ///
    /// A file named explicitly with `--config` must exist; the default file
    /// is optional.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut settings = match &cli.config {
            Some(path) if !path.exists() => {
                return Err(Error::ConfigInvalid(format!(
                    "Settings file {} does not exist",
                    path.display()
                )));
            }
            Some(path) => Self::load(path)?,
            None => Self::load(DEFAULT_SETTINGS_FILE)?,
        };
        settings.apply_cli(cli);
        Ok(settings)
    }

    /// Overlay flags and environment values on top of file values
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(file) = &cli.file {
            self.executable.file = Some(file.clone());
        }
        if let Some(dir) = &cli.working_directory {
            self.executable.working_directory = Some(dir.clone());
        }
        if let Some(parameters) = &cli.parameters {
            self.executable.parameters = Some(Parameters::Line(parameters.clone()));
        }
        if !cli.mappings.is_empty() {
            self.mappings = cli.mappings.clone();
        }
        if cli.no_launch {
            self.no_launch_mode = true;
        }
        if let Some(secs) = cli.discovery_timeout {
            self.discovery_timeout_seconds = secs;
        }
        if let Some(secs) = cli.grace {
            self.shutdown_grace_seconds = secs;
        }
        if let Some(secs) = cli.hold {
            self.no_launch_hold_seconds = secs;
        }
        if let Some(secs) = cli.lease {
            self.lease_seconds = secs;
        }
    }

    /// Check required settings, collecting every problem found
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.no_launch_mode {
            if self.executable.file.as_deref().is_none_or(|f| f.trim().is_empty()) {
                errors.push("- Missing option 'executable.file'".to_string());
            }
            if self.executable.working_directory.is_none() {
                errors.push("- Missing option 'executable.workingDirectory'".to_string());
            }
        }

        if self.mappings.is_empty() {
            errors.push("- Missing mapping configuration, needed for port forwarding".to_string());
        }

        for (index, mapping) in self.mappings.iter().enumerate() {
            if mapping.local_port == 0 {
                errors.push(format!("- Mapping #{}: local port must be 1-65535", index));
            }
            if mapping.public_port == 0 {
                errors.push(format!("- Mapping #{}: public port must be 1-65535", index));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// What to launch, or `None` in no-launch mode or when incomplete
    pub fn launch_spec(&self) -> Option<LaunchSpec> {
        if self.no_launch_mode {
            return None;
        }
        Some(LaunchSpec {
            program: self.executable.file.clone()?,
            working_directory: self.executable.working_directory.clone()?,
            args: self
                .executable
                .parameters
                .as_ref()
                .map(Parameters::to_args)
                .unwrap_or_default(),
        })
    }

    /// Bound on gateway discovery
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_seconds)
    }

    /// Grace period between the close request and the kill
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Hold interval in no-launch mode
    pub fn no_launch_hold(&self) -> Duration {
        Duration::from_secs(self.no_launch_hold_seconds)
    }
}
