//! Fence clamping of continuous manual input.
//!
//! The clamp predicts one control period ahead using the requested
//! velocity only. For each axis moving towards a bound, velocity is capped
//! so the vehicle ends the period exactly at `bound - margin`, and never
//! reversed: if it is already past the margin the axis simply stops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::fence::{Bounds, Fence};
use crate::config::defaults::ATTENUATION_SAFETY_LEVEL;
use crate::config::VehicleConfig;

/// Normalized stick intents in `[-1, 1]`. `vertical` is positive up.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ManualInput {
    pub forward: f64,
    pub right: f64,
    pub vertical: f64,
    pub yaw: f64,
}

impl ManualInput {
    pub fn new(forward: f64, right: f64, vertical: f64, yaw: f64) -> Self {
        Self {
            forward,
            right,
            vertical,
            yaw,
        }
    }

    fn normalized(self) -> Self {
        Self {
            forward: self.forward.clamp(-1.0, 1.0),
            right: self.right.clamp(-1.0, 1.0),
            vertical: self.vertical.clamp(-1.0, 1.0),
            yaw: self.yaw.clamp(-1.0, 1.0),
        }
    }

    #[must_use]
    fn scaled(self, factor: f64) -> Self {
        Self {
            forward: self.forward * factor,
            right: self.right * factor,
            vertical: self.vertical * factor,
            yaw: self.yaw * factor,
        }
    }
}

/// Speeds reached at full stick (m/s).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedLimits {
    pub horizontal: f64,
    pub up: f64,
    pub down: f64,
}

impl From<&VehicleConfig> for SpeedLimits {
    fn from(config: &VehicleConfig) -> Self {
        Self {
            horizontal: config.max_horizontal_speed,
            up: config.max_up_speed,
            down: config.max_down_speed,
        }
    }
}

/// Where the vehicle is when the input is applied.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VehiclePose {
    /// North, east, down (m)
    pub position: [f64; 3],
    /// Radians clockwise from north
    pub heading: f64,
}

impl Fence {
    /// Clamp `input` so that, flown for `period`, it cannot leave the
    /// margin-reduced fence. Pure: identical arguments give identical
    /// results. An inactive fence returns the input unchanged.
    pub fn clamp_manual_input(
        &self,
        pose: &VehiclePose,
        input: ManualInput,
        limits: &SpeedLimits,
        period: Duration,
    ) -> ManualInput {
        if !self.active {
            return input;
        }
        let input = input.normalized();
        let dt = period.as_secs_f64();

        let clamped = if dt > 0.0 {
            let (sin, cos) = pose.heading.sin_cos();

            // Body → NED
            let forward = input.forward * limits.horizontal;
            let right = input.right * limits.horizontal;
            let v_north = forward * cos - right * sin;
            let v_east = forward * sin + right * cos;

            let v_north = clamp_axis(v_north, pose.position[0], self.north, self.margin, dt);
            let v_east = clamp_axis(v_east, pose.position[1], self.east, self.margin, dt);

            // NED → body
            let forward = v_north * cos + v_east * sin;
            let right = -v_north * sin + v_east * cos;

            // Positive intent climbs, i.e. negative down velocity.
            let v_down = if input.vertical >= 0.0 {
                -input.vertical * limits.up
            } else {
                -input.vertical * limits.down
            };
            let v_down = clamp_axis(v_down, pose.position[2], self.down, self.margin, dt);
            let vertical = if v_down <= 0.0 {
                ratio(-v_down, limits.up)
            } else {
                -ratio(v_down, limits.down)
            };

            ManualInput {
                forward: ratio(forward, limits.horizontal),
                right: ratio(right, limits.horizontal),
                vertical,
                yaw: input.yaw,
            }
        } else {
            input
        };

        if self.safety_level >= ATTENUATION_SAFETY_LEVEL {
            clamped.scaled(self.attenuation)
        } else {
            clamped
        }
    }
}

/// Cap `velocity` so `position + velocity * dt` stays within the bound
/// reduced by `margin` in the direction of travel.
fn clamp_axis(velocity: f64, position: f64, bounds: Bounds, margin: f64, dt: f64) -> f64 {
    if velocity > 0.0 {
        let limit = (bounds.upper - margin - position) / dt;
        if velocity > limit {
            limit.max(0.0)
        } else {
            velocity
        }
    } else if velocity < 0.0 {
        let limit = (bounds.lower + margin - position) / dt;
        if velocity < limit {
            limit.min(0.0)
        } else {
            velocity
        }
    } else {
        velocity
    }
}

fn ratio(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn limits() -> SpeedLimits {
        SpeedLimits {
            horizontal: 5.0,
            up: 2.0,
            down: 1.0,
        }
    }

    fn fence(level: u8) -> Fence {
        Fence::new((-5.0, 5.0), (-5.0, 5.0), (-10.0, 0.0), level).unwrap()
    }

    fn pose(n: f64, e: f64, d: f64, heading: f64) -> VehiclePose {
        VehiclePose {
            position: [n, e, d],
            heading,
        }
    }

    const PERIOD: Duration = Duration::from_millis(100);

    #[test]
    fn test_forward_at_north_margin_floors_to_zero() {
        // 4.5 m north with a 1 m margin on a 5 m fence: the raw cap is
        // (5 - 1 - 4.5) / 0.1 = -5 m/s, which would reverse the vehicle.
        let out = fence(0).clamp_manual_input(
            &pose(4.5, 0.0, -2.0, 0.0),
            ManualInput::new(1.0, 0.0, 0.0, 0.0),
            &limits(),
            PERIOD,
        );
        assert!(out.forward.abs() < EPS, "forward = {}", out.forward);
        assert!(out.right.abs() < EPS);
    }

    #[test]
    fn test_partial_cap_reaches_margin_exactly() {
        // 3.8 m north: 0.2 m of room, so 2 m/s of the requested 5.
        let out = fence(0).clamp_manual_input(
            &pose(3.8, 0.0, -2.0, 0.0),
            ManualInput::new(1.0, 0.0, 0.0, 0.0),
            &limits(),
            PERIOD,
        );
        assert!((out.forward - 0.4).abs() < EPS, "forward = {}", out.forward);
    }

    #[test]
    fn test_moving_away_from_bound_is_untouched() {
        let out = fence(0).clamp_manual_input(
            &pose(4.5, 0.0, -2.0, 0.0),
            ManualInput::new(-1.0, 0.0, 0.0, 0.3),
            &limits(),
            PERIOD,
        );
        assert_eq!(out, ManualInput::new(-1.0, 0.0, 0.0, 0.3));
    }

    #[test]
    fn test_heading_rotates_into_the_right_axis() {
        // Facing east, "forward" moves east: the east bound must clamp it.
        let out = fence(0).clamp_manual_input(
            &pose(0.0, 4.5, -2.0, std::f64::consts::FRAC_PI_2),
            ManualInput::new(1.0, 0.0, 0.0, 0.0),
            &limits(),
            PERIOD,
        );
        assert!(out.forward.abs() < EPS);
        assert!(out.right.abs() < EPS);
    }

    #[test]
    fn test_vertical_uses_asymmetric_limits() {
        // 0.5 m above a ground bound at down = 0 with a 1 m margin:
        // descending is stopped, climbing passes at full up speed.
        let f = fence(0);
        let near_ground = pose(0.0, 0.0, -0.5, 0.0);
        let descend = f.clamp_manual_input(&near_ground, ManualInput::new(0.0, 0.0, -1.0, 0.0), &limits(), PERIOD);
        assert!(descend.vertical.abs() < EPS);
        let climb = f.clamp_manual_input(&near_ground, ManualInput::new(0.0, 0.0, 1.0, 0.0), &limits(), PERIOD);
        assert!((climb.vertical - 1.0).abs() < EPS);

        // Near the ceiling (down = -10) climbing is capped: at 8.9 m up there
        // is 0.1 m of room, so 1 m/s of the 2 m/s requested.
        let near_ceiling = pose(0.0, 0.0, -8.9, 0.0);
        let capped = f.clamp_manual_input(&near_ceiling, ManualInput::new(0.0, 0.0, 1.0, 0.0), &limits(), PERIOD);
        assert!((capped.vertical - 0.5).abs() < EPS, "vertical = {}", capped.vertical);
    }

    #[test]
    fn test_high_safety_level_attenuates() {
        let input = ManualInput::new(0.2, -0.4, 0.6, 1.0);
        let centre = pose(0.0, 0.0, -5.0, 0.0);
        for level in [4, 5] {
            let out = fence(level).clamp_manual_input(&centre, input, &limits(), PERIOD);
            assert!((out.forward - 0.1).abs() < EPS);
            assert!((out.right + 0.2).abs() < EPS);
            assert!((out.vertical - 0.3).abs() < EPS);
            assert!((out.yaw - 0.5).abs() < EPS);
        }
        let out = fence(3).clamp_manual_input(&centre, input, &limits(), PERIOD);
        assert!((out.forward - 0.2).abs() < EPS);
    }

    #[test]
    fn test_inactive_fence_passes_through() {
        let mut f = fence(5);
        f.set_active(false);
        let input = ManualInput::new(1.0, 1.0, 1.0, 1.0);
        assert_eq!(
            f.clamp_manual_input(&pose(4.9, 4.9, -0.1, 0.0), input, &limits(), PERIOD),
            input
        );
    }

    #[test]
    fn test_clamp_is_pure_and_bounded() {
        let f = fence(0);
        let margin = f.margin();
        let dt = PERIOD.as_secs_f64();
        let positions = [-4.5, -3.9, -1.0, 0.0, 2.5, 3.95, 4.5];
        let headings = [0.0, 0.7, 2.0, -2.5];
        let intents = [(1.0, 0.0), (0.0, -1.0), (0.7, 0.7), (-1.0, 0.3)];

        for &n in &positions {
            for &e in &positions {
                for &heading in &headings {
                    for &(fwd, right) in &intents {
                        let p = pose(n, e, -3.0, heading);
                        let input = ManualInput::new(fwd, right, 0.0, 0.0);
                        let out = f.clamp_manual_input(&p, input, &limits(), PERIOD);

                        // Same input, same output.
                        assert_eq!(out, f.clamp_manual_input(&p, input, &limits(), PERIOD));

                        // Never faster than requested.
                        let requested = fwd.hypot(right);
                        let granted = out.forward.hypot(out.right);
                        assert!(granted <= requested + EPS);

                        // Never leaves the margin box it started in.
                        let (sin, cos) = heading.sin_cos();
                        let v_n = (out.forward * cos - out.right * sin) * limits().horizontal;
                        let v_e = (out.forward * sin + out.right * cos) * limits().horizontal;
                        for (pos, v) in [(n, v_n), (e, v_e)] {
                            let next = pos + v * dt;
                            if pos <= 5.0 - margin {
                                assert!(next <= 5.0 - margin + EPS, "pos {pos} -> {next}");
                            }
                            if pos >= -5.0 + margin {
                                assert!(next >= -5.0 + margin - EPS, "pos {pos} -> {next}");
                            }
                        }
                    }
                }
            }
        }
    }
}
