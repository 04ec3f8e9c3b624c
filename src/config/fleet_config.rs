//! Fleet configuration loaded from TOML.
//!
//! Every field carries a serde default, so a partial file (or none at all)
//! yields a complete configuration matching the constants in
//! [`super::defaults`].
//!
//! ## Search order
//!
//! 1. `$DRONEFLEET_CONFIG` env var
//! 2. `./dronefleet.toml`
//! 3. Built-in defaults

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::defaults;
use crate::protocol::{Dialect, LinkAddress};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DRONEFLEET_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "dronefleet.toml";

/// Top-level fleet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Relay identity and pacing
    #[serde(default)]
    pub relay: RelayConfig,

    /// Per-vehicle command behaviour and manual control limits
    #[serde(default)]
    pub vehicle: VehicleConfig,

    /// Geofence tuning
    #[serde(default)]
    pub fence: FenceConfig,

    /// Known vehicles, name → dial address (`udp://host:port`)
    #[serde(default)]
    pub vehicles: BTreeMap<String, String>,

    /// Capability autoload list and per-capability settings
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

impl FleetConfig {
    /// Load configuration using the search order above.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), vehicles = config.vehicles.len(), "Loaded fleet config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./dronefleet.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(vehicles = config.vehicles.len(), "Loaded fleet config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML, e.g. to write a starter file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject values that would make the relay or the governor misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let r = &self.relay;

        if r.system_id == 0 {
            errors.push("relay.system_id must be non-zero (0 is the broadcast id)".to_string());
        }
        for (name, value) in [
            ("relay.heartbeat_period_ms", r.heartbeat_period_ms),
            ("relay.ping_period_ms", r.ping_period_ms),
            ("relay.probe_period_ms", r.probe_period_ms),
            ("relay.poll_backoff_ms", r.poll_backoff_ms),
            ("relay.disconnect_threshold_ms", r.disconnect_threshold_ms),
            ("vehicle.control_period_ms", self.vehicle.control_period_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }
        if r.required_heartbeats == 0 {
            errors.push("relay.required_heartbeats must be at least 1".to_string());
        }
        if r.disconnect_threshold_ms <= r.heartbeat_period_ms {
            errors.push(format!(
                "relay.disconnect_threshold_ms ({}) must exceed relay.heartbeat_period_ms ({})",
                r.disconnect_threshold_ms, r.heartbeat_period_ms
            ));
        }

        let v = &self.vehicle;
        for (name, value) in [
            ("vehicle.max_horizontal_speed", v.max_horizontal_speed),
            ("vehicle.max_up_speed", v.max_up_speed),
            ("vehicle.max_down_speed", v.max_down_speed),
        ] {
            if !(value.is_finite() && value > 0.0) {
                errors.push(format!("{name} must be a positive number, got {value}"));
            }
        }

        let f = &self.fence;
        if !(f.margin_m.is_finite() && f.margin_m >= 0.0) {
            errors.push(format!("fence.margin_m must be >= 0, got {}", f.margin_m));
        }
        if !(f.attenuation > 0.0 && f.attenuation <= 1.0) {
            errors.push(format!("fence.attenuation must be in (0, 1], got {}", f.attenuation));
        }

        for (name, address) in &self.vehicles {
            if let Err(e) = address.parse::<LinkAddress>() {
                errors.push(format!("vehicles.{name}: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Relay
// ============================================================================

/// Identity and pacing of one protocol relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub system_id: u8,
    pub component_id: u8,
    pub heartbeat_period_ms: u64,
    pub ping_period_ms: u64,
    pub probe_period_ms: u64,
    pub poll_backoff_ms: u64,
    pub link_error_backoff_ms: u64,
    pub disconnect_threshold_ms: u64,
    pub required_heartbeats: u32,
    pub request_timeout_secs: u64,
    /// Fixed dialect; `None` infers it from the autopilot heartbeat
    pub dialect: Option<Dialect>,
    /// Trace every relayed message
    pub log_messages: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            system_id: defaults::RELAY_SYSTEM_ID,
            component_id: defaults::RELAY_COMPONENT_ID,
            heartbeat_period_ms: defaults::HEARTBEAT_PERIOD_MS,
            ping_period_ms: defaults::PING_PERIOD_MS,
            probe_period_ms: defaults::PROBE_PERIOD_MS,
            poll_backoff_ms: defaults::POLL_BACKOFF_MS,
            link_error_backoff_ms: defaults::LINK_ERROR_BACKOFF_MS,
            disconnect_threshold_ms: defaults::DISCONNECT_THRESHOLD_MS,
            required_heartbeats: defaults::REQUIRED_HEARTBEATS,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            dialect: None,
            log_messages: false,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn probe_period(&self) -> Duration {
        Duration::from_millis(self.probe_period_ms)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }

    pub fn link_error_backoff(&self) -> Duration {
        Duration::from_millis(self.link_error_backoff_ms)
    }

    pub fn disconnect_threshold(&self) -> Duration {
        Duration::from_millis(self.disconnect_threshold_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Vehicle
// ============================================================================

/// Command timeouts and manual control limits applied to every vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub max_horizontal_speed: f64,
    pub max_up_speed: f64,
    pub max_down_speed: f64,
    pub control_period_ms: u64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            command_timeout_secs: defaults::COMMAND_TIMEOUT_SECS,
            max_horizontal_speed: defaults::MAX_HORIZONTAL_SPEED,
            max_up_speed: defaults::MAX_UP_SPEED,
            max_down_speed: defaults::MAX_DOWN_SPEED,
            control_period_ms: defaults::CONTROL_PERIOD_MS,
        }
    }
}

impl VehicleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_millis(self.control_period_ms)
    }
}

// ============================================================================
// Fence
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FenceConfig {
    /// Buffer kept inside every fence bound (m)
    pub margin_m: f64,
    /// Intent scale at high safety levels
    pub attenuation: f64,
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            margin_m: defaults::FENCE_MARGIN_M,
            attenuation: defaults::HIGH_SAFETY_ATTENUATION,
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// `[capabilities]` section: an autoload list plus one table per capability.
///
/// ```toml
/// [capabilities]
/// autoload = ["status_feed"]
///
/// [capabilities.status_feed]
/// port = 31659
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    #[serde(default)]
    pub autoload: Vec<String>,

    #[serde(flatten)]
    pub settings: BTreeMap<String, toml::Value>,
}

impl CapabilitiesConfig {
    /// Settings table for one capability, empty when not configured.
    pub fn settings_for(&self, name: &str) -> toml::Table {
        match self.settings.get(name) {
            Some(toml::Value::Table(table)) => table.clone(),
            _ => toml::Table::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.system_id, 246);
        assert_eq!(config.relay.component_id, 201);
        assert_eq!(config.relay.disconnect_threshold(), Duration::from_secs(2));
        assert!(config.relay.dialect.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[relay]
heartbeat_period_ms = 250
dialect = "ardupilotmega"

[vehicles]
luke = "udp://192.168.1.31:14561"

[capabilities]
autoload = ["status_feed"]

[capabilities.status_feed]
port = 40000
"#
        )
        .unwrap();

        let config = FleetConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.relay.heartbeat_period_ms, 250);
        assert_eq!(config.relay.ping_period_ms, defaults::PING_PERIOD_MS);
        assert_eq!(config.relay.dialect, Some(Dialect::ArduPilotMega));
        assert_eq!(config.vehicles.len(), 1);
        assert_eq!(config.capabilities.autoload, vec!["status_feed".to_string()]);
        let feed = config.capabilities.settings_for("status_feed");
        assert_eq!(feed.get("port").and_then(toml::Value::as_integer), Some(40000));
        assert!(config.capabilities.settings_for("missing").is_empty());
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = FleetConfig::default();
        config.relay.system_id = 0;
        config.relay.required_heartbeats = 0;
        config.fence.attenuation = 1.5;
        config.vehicles.insert("bad".to_string(), "tcp:/nowhere".to_string());

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("vehicles.bad")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[relay\nsystem_id = ").unwrap();
        let err = FleetConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
        assert!(err.to_string().contains("Config parse error"));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let mut config = FleetConfig::default();
        config.vehicles.insert("tom".to_string(), "udp://:14540".to_string());
        let text = config.to_toml().unwrap();
        let back: FleetConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.vehicles.get("tom").map(String::as_str), Some("udp://:14540"));
    }
}
