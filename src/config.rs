//! Configuration system for hieravg nodes
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (HIERAVG_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::types::ParamVector;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listening socket and payload shape
    pub node: NodeSettings,

    /// Adaptive round timeout
    pub schedule: ScheduleSettings,

    /// Parent connection (relay role)
    pub relay: RelaySettings,

    /// Leaf client settings
    pub leaf: LeafSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Listening socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Interface to bind
    pub host: String,

    /// TCP port to listen on (0 = auto-assign)
    pub port: u16,

    /// Length of every parameter vector exchanged by this tree
    pub dimension: usize,

    /// Largest accepted frame payload in bytes
    pub max_frame_bytes: u32,

    /// Deadline for one frame write to a peer; a child that stops reading
    /// is dropped once it expires
    pub send_timeout_ms: u64,

    /// Deadline for connecting and receiving the parent's `Hello`
    pub handshake_timeout_ms: u64,
}

/// How a delay grows toward its upper bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// `delay + step`
    Additive { step_ms: u64 },
    /// `delay * factor`
    Multiplicative { factor: f64 },
}

impl GrowthPolicy {
    /// Apply the policy once, clamped to `max`
    pub fn grow(&self, delay: Duration, max: Duration) -> Duration {
        let grown = match *self {
            GrowthPolicy::Additive { step_ms } => delay.saturating_add(Duration::from_millis(step_ms)),
            GrowthPolicy::Multiplicative { factor } => delay.mul_f64(factor),
        };
        grown.min(max)
    }

    fn validate(&self, field: &str) -> Result<()> {
        match *self {
            GrowthPolicy::Additive { step_ms: 0 } => Err(Error::config_field_invalid(
                field,
                format!("{field}: additive step_ms must be greater than 0"),
            )),
            GrowthPolicy::Multiplicative { factor } if !(factor.is_finite() && factor > 1.0) => {
                Err(Error::config_field_invalid(
                    field,
                    format!("{field}: multiplicative factor must be greater than 1.0 (got {factor})"),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Adaptive round timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Round timeout at node start
    pub initial_delay_ms: u64,

    /// Lower bound reached by repeated quorum closures
    pub min_delay_ms: u64,

    /// Upper bound reached by repeated empty or timed-out rounds
    pub max_delay_ms: u64,

    /// Multiplier applied after a quorum closure (0 < x < 1)
    pub shrink_factor: f64,

    /// Growth after a round closes with no weight collected
    pub empty_growth: GrowthPolicy,

    /// Growth after a round closes on timeout
    pub timeout_growth: GrowthPolicy,

    /// Upper bound on the scheduler tick; the effective tick is min(poll, delay / 10)
    pub poll_interval_ms: u64,
}

/// Parent connection settings for relay nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Parent node host
    pub parent_host: String,

    /// Parent node port
    pub parent_port: u16,

    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
}

/// Leaf client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafSettings {
    /// Node to connect to
    pub server_host: String,

    /// Port of the node to connect to
    pub server_port: u16,

    /// Vector submitted every round
    pub value: Vec<f64>,

    /// Weight attached to every update
    pub weight: f64,

    /// Time between receiving a state and submitting an update
    pub update_interval_ms: u64,

    /// Number of rounds to take part in (0 = until stopped)
    pub rounds: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 30000,
            dimension: 1,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            send_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10_000,
            min_delay_ms: 5_000,
            max_delay_ms: 30_000,
            shrink_factor: 0.5,
            empty_growth: GrowthPolicy::Multiplicative { factor: 2.0 },
            timeout_growth: GrowthPolicy::Multiplicative { factor: 1.1 },
            poll_interval_ms: 100,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            parent_host: "127.0.0.1".to_string(),
            parent_port: 30000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 10_000,
            max_reconnect_attempts: 0, // Infinite
        }
    }
}

impl Default for LeafSettings {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 30000,
            value: vec![1.0],
            weight: 1.0,
            update_interval_ms: 5000,
            rounds: 0, // Until stopped
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl NodeSettings {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl RelaySettings {
    pub fn parent_addr(&self) -> String {
        format!("{}:{}", self.parent_host, self.parent_port)
    }
}

impl LeafSettings {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn update_vector(&self) -> ParamVector {
        ParamVector::from_vec(self.value.clone())
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            Some(PathBuf::from("hieravg.toml")),
            // User config directory
            dirs::config_dir().map(|p| p.join("hieravg").join("node.toml")),
            // Home directory
            dirs::home_dir().map(|p| p.join(".hieravg").join("node.toml")),
            // System config (Linux)
            Some(PathBuf::from("/etc/hieravg/node.toml")),
        ];

        for path in search_paths.iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("HIERAVG_HOST") {
            self.node.host = val;
        }
        env_parse("HIERAVG_PORT", &mut self.node.port);
        env_parse("HIERAVG_DIMENSION", &mut self.node.dimension);
        env_parse("HIERAVG_MAX_FRAME_BYTES", &mut self.node.max_frame_bytes);
        env_parse("HIERAVG_SEND_TIMEOUT_MS", &mut self.node.send_timeout_ms);
        env_parse("HIERAVG_HANDSHAKE_TIMEOUT_MS", &mut self.node.handshake_timeout_ms);

        // Schedule settings
        env_parse("HIERAVG_INITIAL_DELAY_MS", &mut self.schedule.initial_delay_ms);
        env_parse("HIERAVG_MIN_DELAY_MS", &mut self.schedule.min_delay_ms);
        env_parse("HIERAVG_MAX_DELAY_MS", &mut self.schedule.max_delay_ms);
        env_parse("HIERAVG_POLL_INTERVAL_MS", &mut self.schedule.poll_interval_ms);

        // Relay settings
        if let Ok(val) = std::env::var("HIERAVG_PARENT_HOST") {
            self.relay.parent_host = val;
        }
        env_parse("HIERAVG_PARENT_PORT", &mut self.relay.parent_port);
        env_parse("HIERAVG_MAX_RECONNECT_ATTEMPTS", &mut self.relay.max_reconnect_attempts);

        // Leaf settings
        if let Ok(val) = std::env::var("HIERAVG_SERVER_HOST") {
            self.leaf.server_host = val;
        }
        env_parse("HIERAVG_SERVER_PORT", &mut self.leaf.server_port);
        env_parse("HIERAVG_WEIGHT", &mut self.leaf.weight);

        // Logging settings
        if let Ok(val) = std::env::var("HIERAVG_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("HIERAVG_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("HIERAVG_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.dimension == 0 {
            return Err(Error::config_field_invalid(
                "node.dimension",
                "node.dimension must be at least 1",
            ));
        }
        if self.node.max_frame_bytes == 0 {
            return Err(Error::config_field_invalid(
                "node.max_frame_bytes",
                "node.max_frame_bytes must be greater than 0",
            ));
        }

        if self.node.send_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "node.send_timeout_ms",
                "node.send_timeout_ms must be greater than 0",
            ));
        }
        if self.node.handshake_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "node.handshake_timeout_ms",
                "node.handshake_timeout_ms must be greater than 0",
            ));
        }

        let schedule = &self.schedule;
        if schedule.min_delay_ms == 0 {
            return Err(Error::config_field_invalid(
                "schedule.min_delay_ms",
                "schedule.min_delay_ms must be greater than 0",
            ));
        }
        if schedule.min_delay_ms > schedule.max_delay_ms {
            return Err(Error::config_field_invalid(
                "schedule.min_delay_ms",
                format!(
                    "schedule.min_delay_ms ({}) exceeds schedule.max_delay_ms ({})",
                    schedule.min_delay_ms, schedule.max_delay_ms
                ),
            ));
        }
        if !(schedule.shrink_factor > 0.0 && schedule.shrink_factor < 1.0) {
            return Err(Error::config_field_invalid(
                "schedule.shrink_factor",
                format!(
                    "schedule.shrink_factor must be between 0 and 1 exclusive (got {})",
                    schedule.shrink_factor
                ),
            ));
        }
        if schedule.poll_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "schedule.poll_interval_ms",
                "schedule.poll_interval_ms must be greater than 0",
            ));
        }
        schedule.empty_growth.validate("schedule.empty_growth")?;
        schedule.timeout_growth.validate("schedule.timeout_growth")?;

        if self.relay.reconnect_initial_ms == 0 || self.relay.reconnect_initial_ms > self.relay.reconnect_max_ms {
            return Err(Error::config_field_invalid(
                "relay.reconnect_initial_ms",
                "relay.reconnect_initial_ms must be greater than 0 and not exceed relay.reconnect_max_ms",
            ));
        }

        if !(self.leaf.weight.is_finite() && self.leaf.weight > 0.0) {
            return Err(Error::config_field_invalid(
                "leaf.weight",
                format!("leaf.weight must be a positive number (got {})", self.leaf.weight),
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(n) = val.parse() {
            *target = n;
        }
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hieravg")
        .join("node.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(&config_path, generate_default_config())?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# hieravg node configuration

[node]
# Interface to bind
host = "0.0.0.0"

# TCP port to listen on
port = 30000

# Length of every parameter vector exchanged by this tree
dimension = 1

# Largest accepted frame payload in bytes
max_frame_bytes = 67108864

# Deadline for one frame write; children that stop reading are dropped (milliseconds)
send_timeout_ms = 5000

# Deadline for connecting and receiving Hello (milliseconds)
handshake_timeout_ms = 10000

[schedule]
# Round timeout at node start (milliseconds)
initial_delay_ms = 10000

# Bounds for the adaptive round timeout (milliseconds)
min_delay_ms = 5000
max_delay_ms = 30000

# Multiplier applied when every child responded before the timeout
shrink_factor = 0.5

# Growth after an empty round, and after a round that timed out.
# Either { kind = "multiplicative", factor = 1.5 } or { kind = "additive", step_ms = 1000 }
empty_growth = { kind = "multiplicative", factor = 2.0 }
timeout_growth = { kind = "multiplicative", factor = 1.1 }

# Upper bound on the scheduler tick (milliseconds)
poll_interval_ms = 100

[relay]
# Parent node for the relay role
parent_host = "127.0.0.1"
parent_port = 30000

# Reconnect backoff (milliseconds)
reconnect_initial_ms = 500
reconnect_max_ms = 10000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

[leaf]
# Node the leaf client connects to
server_host = "127.0.0.1"
server_port = 30000

# Vector and weight submitted every round
value = [1.0]
weight = 1.0

# Delay between receiving a state and submitting (milliseconds)
update_interval_ms = 5000

# Rounds to take part in (0 = until stopped)
rounds = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.hieravg/logs/node.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.node.port, 30000);
        assert_eq!(config.schedule.min_delay_ms, 5000);
        assert_eq!(config.schedule.max_delay_ms, 30000);
        assert_eq!(config.relay.parent_addr(), "127.0.0.1:30000");
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        env::set_var("HIERAVG_PARENT_HOST", "10.1.2.3");
        env::set_var("HIERAVG_MIN_DELAY_MS", "1500");
        env::set_var("HIERAVG_LOG_LEVEL", "debug");

        let mut config = NodeConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.relay.parent_host, "10.1.2.3");
        assert_eq!(config.schedule.min_delay_ms, 1500);
        assert_eq!(config.logging.level, "debug");

        env::remove_var("HIERAVG_PARENT_HOST");
        env::remove_var("HIERAVG_MIN_DELAY_MS");
        env::remove_var("HIERAVG_LOG_LEVEL");
    }

    #[test]
    fn test_validation_min_exceeds_max() {
        let mut config = NodeConfig::default();
        config.schedule.min_delay_ms = 40_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_delay_ms"));
    }

    #[test]
    fn test_validation_shrink_factor_range() {
        let mut config = NodeConfig::default();
        config.schedule.shrink_factor = 1.0;
        assert!(config.validate().is_err());
        config.schedule.shrink_factor = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_growth_policies() {
        let mut config = NodeConfig::default();
        config.schedule.timeout_growth = GrowthPolicy::Multiplicative { factor: 1.0 };
        assert!(config.validate().is_err());

        config.schedule.timeout_growth = GrowthPolicy::Additive { step_ms: 0 };
        assert!(config.validate().is_err());

        config.schedule.timeout_growth = GrowthPolicy::Additive { step_ms: 1000 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_dimension() {
        let mut config = NodeConfig::default();
        config.node.dimension = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_timeouts() {
        let mut config = NodeConfig::default();
        config.node.send_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.node.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = NodeConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_growth_policy_clamps() {
        let max = Duration::from_secs(30);
        let additive = GrowthPolicy::Additive { step_ms: 1000 };
        assert_eq!(additive.grow(Duration::from_secs(10), max), Duration::from_secs(11));
        assert_eq!(additive.grow(Duration::from_millis(29_500), max), max);

        let doubling = GrowthPolicy::Multiplicative { factor: 2.0 };
        assert_eq!(doubling.grow(Duration::from_secs(10), max), Duration::from_secs(20));
        assert_eq!(doubling.grow(Duration::from_secs(20), max), max);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = NodeConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.node.port, parsed.node.port);
        assert_eq!(config.schedule.empty_growth, parsed.schedule.empty_growth);
    }

    #[test]
    fn test_generated_default_parses() {
        let parsed: NodeConfig = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(parsed.node.port, NodeConfig::default().node.port);
        assert_eq!(
            parsed.schedule.timeout_growth,
            GrowthPolicy::Multiplicative { factor: 1.1 }
        );
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[node]
port = 31000
dimension = 3

[schedule]
min_delay_ms = 1000
empty_growth = { kind = "additive", step_ms = 1000 }

[relay]
parent_host = "10.0.0.1"

[logging]
level = "debug"
"#;

        let config: NodeConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.node.port, 31000);
        assert_eq!(config.node.dimension, 3);
        assert_eq!(config.node.host, "0.0.0.0");
        assert_eq!(config.schedule.min_delay_ms, 1000);
        assert_eq!(config.schedule.empty_growth, GrowthPolicy::Additive { step_ms: 1000 });
        assert_eq!(config.relay.parent_host, "10.0.0.1");
        assert_eq!(config.logging.level, "debug");
    }
}
