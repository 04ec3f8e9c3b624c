//! System-wide default constants.
//!
//! Wire identities, pacing periods and safety parameters in one place.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Relay Identity
// ============================================================================

/// System id the relay stamps on its own heartbeats and pings.
pub const RELAY_SYSTEM_ID: u8 = 246;

/// Component id the relay stamps on its own heartbeats and pings.
pub const RELAY_COMPONENT_ID: u8 = 201;

/// Component id of a vehicle's autopilot. Probe heartbeats are only counted
/// when they come from this component.
pub const AUTOPILOT_COMPONENT_ID: u8 = 1;

// ============================================================================
// Relay Pacing
// ============================================================================

/// Period between outgoing heartbeats on each link (ms).
pub const HEARTBEAT_PERIOD_MS: u64 = 500;

/// Period between outgoing liveness pings on each link (ms).
pub const PING_PERIOD_MS: u64 = 5_000;

/// Period between heartbeat probes during the vehicle handshake (ms).
pub const PROBE_PERIOD_MS: u64 = 500;

/// Backoff when a relay loop drains nothing (ms).
pub const POLL_BACKOFF_MS: u64 = 1;

/// Backoff after a link read error, so a dead link does not spin (ms).
pub const LINK_ERROR_BACKOFF_MS: u64 = 100;

/// A side is considered disconnected when silent for longer than this (ms).
pub const DISCONNECT_THRESHOLD_MS: u64 = 2_000;

/// Heartbeats from the autopilot required before a link is accepted.
pub const REQUIRED_HEARTBEATS: u32 = 3;

/// Default wait for `request_message` (seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Vehicle
// ============================================================================

/// Default connect timeout per vehicle (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// How long a vehicle command waits for its ack (seconds).
pub const COMMAND_TIMEOUT_SECS: u64 = 3;

/// Horizontal speed at full stick (m/s).
pub const MAX_HORIZONTAL_SPEED: f64 = 5.0;

/// Climb speed at full stick (m/s).
pub const MAX_UP_SPEED: f64 = 2.0;

/// Descent speed at full stick (m/s).
pub const MAX_DOWN_SPEED: f64 = 1.0;

/// Manual control period used for fence prediction (ms).
pub const CONTROL_PERIOD_MS: u64 = 100;

// ============================================================================
// Geofence
// ============================================================================

/// Buffer kept between the predicted position and the fence (m).
pub const FENCE_MARGIN_M: f64 = 1.0;

/// Intent scaling applied at safety levels 4 and 5.
pub const HIGH_SAFETY_ATTENUATION: f64 = 0.5;

/// Highest valid safety level.
pub const MAX_SAFETY_LEVEL: u8 = 5;

/// Safety level at which attenuation begins.
pub const ATTENUATION_SAFETY_LEVEL: u8 = 4;

// ============================================================================
// Status Feed
// ============================================================================

/// UDP port of the status feed capability.
pub const STATUS_FEED_PORT: u16 = 31_659;

/// Lowest status feed frequency a client may request (Hz).
pub const STATUS_FEED_MIN_HZ: f64 = 1.0 / 60.0;

/// Highest status feed frequency a client may request (Hz).
pub const STATUS_FEED_MAX_HZ: f64 = 20.0;
