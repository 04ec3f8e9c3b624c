//! Rectangular local-frame geofence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::waypoint::{Waypoint, WaypointFrame};
use crate::config::defaults::{HIGH_SAFETY_ATTENUATION, FENCE_MARGIN_M, MAX_SAFETY_LEVEL};
use crate::config::FenceConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FenceError {
    #[error("{axis} bounds must satisfy lower < upper, got [{lower}, {upper}]")]
    InvalidBounds {
        axis: &'static str,
        lower: f64,
        upper: f64,
    },

    #[error("safety level {0} is outside 0..=5")]
    InvalidSafetyLevel(u8),

    #[error("margin must be a finite, non-negative distance, got {0}")]
    InvalidMargin(f64),

    #[error("attenuation must be in (0, 1], got {0}")]
    InvalidAttenuation(f64),
}

/// Open interval along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Bounds {
    fn new(axis: &'static str, (lower, upper): (f64, f64)) -> Result<Self, FenceError> {
        // Also rejects NaN.
        if lower < upper {
            Ok(Self { lower, upper })
        } else {
            Err(FenceError::InvalidBounds { axis, lower, upper })
        }
    }

    pub fn contains_strict(&self, value: f64) -> bool {
        self.lower < value && value < self.upper
    }
}

/// Box in the local North-East-Down frame plus the safety parameters used
/// when clamping manual input against it. Deserializing goes through the
/// same checks as [`Fence::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FenceFields")]
pub struct Fence {
    pub(super) north: Bounds,
    pub(super) east: Bounds,
    pub(super) down: Bounds,
    pub(super) safety_level: u8,
    pub(super) margin: f64,
    pub(super) attenuation: f64,
    pub(super) active: bool,
}

/// Unchecked wire form of [`Fence`].
#[derive(Deserialize)]
struct FenceFields {
    north: Bounds,
    east: Bounds,
    down: Bounds,
    safety_level: u8,
    #[serde(default = "default_margin")]
    margin: f64,
    #[serde(default = "default_attenuation")]
    attenuation: f64,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_margin() -> f64 {
    FENCE_MARGIN_M
}

fn default_attenuation() -> f64 {
    HIGH_SAFETY_ATTENUATION
}

fn default_active() -> bool {
    true
}

impl TryFrom<FenceFields> for Fence {
    type Error = FenceError;

    fn try_from(fields: FenceFields) -> Result<Self, Self::Error> {
        let axis = |b: Bounds| (b.lower, b.upper);
        let mut fence = Self::new(axis(fields.north), axis(fields.east), axis(fields.down), fields.safety_level)?
            .with_margin(fields.margin)?
            .with_attenuation(fields.attenuation)?;
        fence.active = fields.active;
        Ok(fence)
    }
}

impl Fence {
    /// Active fence with the default margin and attenuation. Each axis is
    /// `(lower, upper)` in metres; down is positive below the origin.
    pub fn new(
        north: (f64, f64),
        east: (f64, f64),
        down: (f64, f64),
        safety_level: u8,
    ) -> Result<Self, FenceError> {
        if safety_level > MAX_SAFETY_LEVEL {
            return Err(FenceError::InvalidSafetyLevel(safety_level));
        }
        Ok(Self {
            north: Bounds::new("north", north)?,
            east: Bounds::new("east", east)?,
            down: Bounds::new("down", down)?,
            safety_level,
            margin: FENCE_MARGIN_M,
            attenuation: HIGH_SAFETY_ATTENUATION,
            active: true,
        })
    }

    /// Like [`Fence::new`] with margin and attenuation from config.
    pub fn from_config(
        north: (f64, f64),
        east: (f64, f64),
        down: (f64, f64),
        safety_level: u8,
        config: &FenceConfig,
    ) -> Result<Self, FenceError> {
        Self::new(north, east, down, safety_level)?
            .with_margin(config.margin_m)?
            .with_attenuation(config.attenuation)
    }

    pub fn with_margin(mut self, margin: f64) -> Result<Self, FenceError> {
        if !(margin.is_finite() && margin >= 0.0) {
            return Err(FenceError::InvalidMargin(margin));
        }
        self.margin = margin;
        Ok(self)
    }

    pub fn with_attenuation(mut self, attenuation: f64) -> Result<Self, FenceError> {
        if !(attenuation > 0.0 && attenuation <= 1.0) {
            return Err(FenceError::InvalidAttenuation(attenuation));
        }
        self.attenuation = attenuation;
        Ok(self)
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn north(&self) -> Bounds {
        self.north
    }

    pub fn east(&self) -> Bounds {
        self.east
    }

    pub fn down(&self) -> Bounds {
        self.down
    }

    pub fn safety_level(&self) -> u8 {
        self.safety_level
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    pub fn attenuation(&self) -> f64 {
        self.attenuation
    }

    /// True iff the fence is active, the waypoint is expressed in a local
    /// NED frame and every coordinate lies strictly inside the bounds.
    pub fn waypoint_admissible(&self, waypoint: &Waypoint) -> bool {
        if !self.active {
            return false;
        }
        match waypoint.frame {
            WaypointFrame::PosNed | WaypointFrame::PosVelNed | WaypointFrame::PosVelAccNed => {}
            WaypointFrame::Global => return false,
        }
        let [n, e, d] = waypoint.position;
        self.north.contains_strict(n) && self.east.contains_strict(e) && self.down.contains_strict(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence() -> Fence {
        Fence::new((-5.0, 5.0), (-5.0, 5.0), (-10.0, 0.5), 0).unwrap()
    }

    #[test]
    fn test_deserializing_validates() {
        let parsed: Fence = serde_json::from_str(&serde_json::to_string(&fence()).unwrap()).unwrap();
        assert_eq!(parsed, fence());

        let inverted = r#"{"north":{"lower":5.0,"upper":-5.0},"east":{"lower":-1.0,"upper":1.0},
            "down":{"lower":-1.0,"upper":1.0},"safety_level":0}"#;
        let err = serde_json::from_str::<Fence>(inverted).unwrap_err();
        assert!(err.to_string().contains("north bounds"), "{err}");

        let too_safe = r#"{"north":{"lower":-1.0,"upper":1.0},"east":{"lower":-1.0,"upper":1.0},
            "down":{"lower":-1.0,"upper":1.0},"safety_level":9}"#;
        let err = serde_json::from_str::<Fence>(too_safe).unwrap_err();
        assert!(err.to_string().contains("safety level 9"), "{err}");

        let defaults: Fence = serde_json::from_str(
            r#"{"north":{"lower":-1.0,"upper":1.0},"east":{"lower":-1.0,"upper":1.0},
            "down":{"lower":-1.0,"upper":1.0},"safety_level":2}"#,
        )
        .unwrap();
        assert!(defaults.is_active());
        assert_eq!(defaults.margin(), FENCE_MARGIN_M);
    }

    #[test]
    fn test_rejects_inverted_or_empty_bounds() {
        assert!(matches!(
            Fence::new((5.0, -5.0), (-1.0, 1.0), (-1.0, 1.0), 0),
            Err(FenceError::InvalidBounds { axis: "north", .. })
        ));
        assert!(matches!(
            Fence::new((-1.0, 1.0), (2.0, 2.0), (-1.0, 1.0), 0),
            Err(FenceError::InvalidBounds { axis: "east", .. })
        ));
        assert!(matches!(
            Fence::new((-1.0, 1.0), (-1.0, 1.0), (f64::NAN, 1.0), 0),
            Err(FenceError::InvalidBounds { axis: "down", .. })
        ));
    }

    #[test]
    fn test_safety_level_range() {
        assert!(Fence::new((-1.0, 1.0), (-1.0, 1.0), (-1.0, 1.0), 5).is_ok());
        assert_eq!(
            Fence::new((-1.0, 1.0), (-1.0, 1.0), (-1.0, 1.0), 6),
            Err(FenceError::InvalidSafetyLevel(6))
        );
    }

    #[test]
    fn test_margin_and_attenuation_validation() {
        assert!(fence().with_margin(-0.1).is_err());
        assert!(fence().with_margin(f64::INFINITY).is_err());
        assert!(fence().with_attenuation(0.0).is_err());
        assert_eq!(fence().with_margin(2.0).unwrap().margin(), 2.0);
    }

    #[test]
    fn test_waypoint_strictly_inside() {
        let f = fence();
        assert!(f.waypoint_admissible(&Waypoint::ned(0.0, 0.0, -2.0)));
        assert!(f.waypoint_admissible(&Waypoint::ned(4.99, -4.99, 0.49)));
        // Boundaries are excluded.
        assert!(!f.waypoint_admissible(&Waypoint::ned(5.0, 0.0, -2.0)));
        assert!(!f.waypoint_admissible(&Waypoint::ned(0.0, -5.0, -2.0)));
        assert!(!f.waypoint_admissible(&Waypoint::ned(0.0, 0.0, 0.5)));
    }

    #[test]
    fn test_waypoint_frame_and_activity() {
        let mut f = fence();
        let with_velocity = Waypoint::ned(1.0, 1.0, -1.0).with_velocity([1.0, 0.0, 0.0]);
        assert!(f.waypoint_admissible(&with_velocity));
        assert!(!f.waypoint_admissible(&Waypoint::global(52.0, 13.0, 30.0)));

        f.set_active(false);
        assert!(!f.waypoint_admissible(&Waypoint::ned(0.0, 0.0, -1.0)));
    }
}
