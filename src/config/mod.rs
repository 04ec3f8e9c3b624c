//! Fleet Configuration Module
//!
//! Relay identity, pacing, vehicle limits and capability settings loaded
//! from TOML.
//!
//! ## Loading Order
//!
//! 1. `DRONEFLEET_CONFIG` environment variable (path to TOML file)
//! 2. `dronefleet.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! ## Usage
//!
//! The binary calls `config::init()` once at startup. Library types take
//! their section by value so tests can run several fleets side by side:
//!
//! ```ignore
//! config::init(FleetConfig::load());
//! let relay_cfg = config::get().relay.clone();
//! ```

mod fleet_config;
pub mod defaults;

pub use fleet_config::*;

use std::sync::OnceLock;

/// Global fleet configuration, initialized once at startup.
static FLEET_CONFIG: OnceLock<FleetConfig> = OnceLock::new();

/// Initialize the global fleet configuration.
///
/// A second call is ignored with a warning.
pub fn init(config: FleetConfig) {
    if FLEET_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get the global fleet configuration, or the built-in defaults when
/// `init()` has not been called.
pub fn get() -> &'static FleetConfig {
    FLEET_CONFIG.get_or_init(FleetConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    FLEET_CONFIG.get().is_some()
}
