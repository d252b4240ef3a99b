use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

/// Default scan interval in seconds.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 5;

/// Default local port range used when the remote port itself is taken.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (3000, 10000);

/// Remote ports below this are never auto-forwarded (system services).
pub const DEFAULT_SKIP_THRESHOLD: u16 = 1000;

/// Remote ports above this are shown but not auto-forwarded.
pub const DEFAULT_MAX_AUTO_PORT: u16 = 10000;

/// Per-direction copy buffer for the data pump. 64 KiB keeps sustained
/// transfers fast without noticeable memory cost per connection.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// How long a closing tunnel may drain open connections before they are
/// forcibly aborted.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

/// Consecutive channel-open failures before a tunnel is declared failed.
pub const DEFAULT_CHANNEL_FAIL_THRESHOLD: u32 = 3;

/// Upper bound on one remote scan round-trip.
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 15;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("port range '{0}' is not of the form min:max")]
    MalformedPortRange(String),

    #[error("invalid port range {0}-{1}: min must be >= 1 and <= max")]
    InvalidPortRange(u16, u16),

    #[error("scan interval must be greater than zero")]
    ZeroScanInterval,

    #[error("buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("channel failure threshold must be at least 1")]
    ZeroFailThreshold,
}

/// Runtime configuration for the forwarding core, built by the CLI layer and
/// validated once before the control loop starts.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Interval between remote inventory scans.
    pub scan_interval: Duration,
    /// Inclusive local port range for conflict resolution.
    pub port_range: (u16, u16),
    /// Remote ports below this value are not auto-forwarded.
    pub skip_threshold: u16,
    /// Additional remote ports to never auto-forward.
    pub skip_ports: HashSet<u16>,
    /// Remote ports above this value are not auto-forwarded.
    pub max_auto_port: u16,
    /// Per-direction copy buffer size in bytes.
    pub buffer_size: usize,
    /// Bound on connection draining when a tunnel closes.
    pub drain_timeout: Duration,
    /// Consecutive channel-open failures that fail the whole tunnel.
    pub channel_fail_threshold: u32,
    /// Bound on one scan round-trip through the transport.
    pub scan_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            port_range: DEFAULT_PORT_RANGE,
            skip_threshold: DEFAULT_SKIP_THRESHOLD,
            skip_ports: HashSet::new(),
            max_auto_port: DEFAULT_MAX_AUTO_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            channel_fail_threshold: DEFAULT_CHANNEL_FAIL_THRESHOLD,
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS),
        }
    }
}

impl ForwardConfig {
    /// Check invariants the control loop relies on. Called once at startup;
    /// any error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = self.port_range;
        if min == 0 || min > max {
            return Err(ConfigError::InvalidPortRange(min, max));
        }
        if self.scan_interval.is_zero() {
            return Err(ConfigError::ZeroScanInterval);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.channel_fail_threshold == 0 {
            return Err(ConfigError::ZeroFailThreshold);
        }
        Ok(())
    }

    /// Whether a remote port qualifies for automatic forwarding.
    pub fn auto_forwardable(&self, port: u16) -> bool {
        port >= self.skip_threshold && port <= self.max_auto_port && !self.skip_ports.contains(&port)
    }
}
