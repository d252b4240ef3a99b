use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::{ConfigError, ForwardConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors (if enabled)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for machine parsing
    Json,
}

/// Color output mode.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum ColorMode {
    /// Auto-detect based on terminal capabilities
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl ColorMode {
    pub fn should_enable(&self) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "port-mirror")]
#[command(
    author,
    version,
    about = "Mirror remote listening TCP ports to local listeners over a single SSH connection"
)]
pub struct Cli {
    /// Remote host in format `[user@]host`
    #[arg(value_name = "HOST")]
    pub host: String,

    /// Seconds between remote port scans
    #[arg(short = 'i', long = "interval", default_value = "5")]
    pub interval: u64,

    /// Local port range for conflict resolution, as `min:max`
    #[arg(short = 'p', long = "port-range", default_value = "3000:10000")]
    pub port_range: String,

    /// Remote ports to never auto-forward (comma-separated)
    #[arg(short = 's', long = "skip", value_delimiter = ',')]
    pub skip: Vec<u16>,

    /// Highest remote port that is auto-forwarded
    #[arg(short = 'm', long = "max-auto-port", default_value = "10000")]
    pub max_auto_port: u16,

    /// SSH port (overrides ~/.ssh/config)
    #[arg(short = 'P', long = "ssh-port")]
    pub ssh_port: Option<u16>,

    /// Shortcut for --log-level debug
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Enable colored log output (auto-detected by default)
    #[arg(long = "color", default_value = "auto")]
    pub color: ColorMode,
}

impl Cli {
    /// Build the validated forwarding configuration.
    pub fn forward_config(&self) -> Result<ForwardConfig, ConfigError> {
        let config = ForwardConfig {
            scan_interval: Duration::from_secs(self.interval),
            port_range: parse_port_range(&self.port_range)?,
            skip_ports: self.skip.iter().copied().collect(),
            max_auto_port: self.max_auto_port,
            ..ForwardConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn effective_log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }
}

fn parse_port_range(raw: &str) -> Result<(u16, u16), ConfigError> {
    let malformed = || ConfigError::MalformedPortRange(raw.to_string());
    let (min, max) = raw.split_once(':').ok_or_else(malformed)?;
    let min = min.trim().parse().map_err(|_| malformed())?;
    let max = max.trim().parse().map_err(|_| malformed())?;
    Ok((min, max))
}
