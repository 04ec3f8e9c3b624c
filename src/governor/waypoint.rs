use serde::{Deserialize, Serialize};

/// Coordinate frame of a waypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaypointFrame {
    /// Local NED position
    PosNed,
    /// Local NED position with a feed-forward velocity
    PosVelNed,
    /// Local NED position, velocity and acceleration
    PosVelAccNed,
    /// Latitude (deg), longitude (deg), altitude (m)
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub frame: WaypointFrame,
    /// North, east, down in metres, or lat/lon/alt for `Global`
    pub position: [f64; 3],
    pub velocity: Option<[f64; 3]>,
    pub acceleration: Option<[f64; 3]>,
    /// Heading in radians, clockwise from north
    pub yaw: Option<f64>,
}

impl Waypoint {
    pub fn ned(north: f64, east: f64, down: f64) -> Self {
        Self {
            frame: WaypointFrame::PosNed,
            position: [north, east, down],
            velocity: None,
            acceleration: None,
            yaw: None,
        }
    }

    pub fn global(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            frame: WaypointFrame::Global,
            position: [latitude, longitude, altitude],
            velocity: None,
            acceleration: None,
            yaw: None,
        }
    }

    #[must_use]
    pub fn with_velocity(mut self, velocity: [f64; 3]) -> Self {
        self.velocity = Some(velocity);
        if self.frame == WaypointFrame::PosNed {
            self.frame = WaypointFrame::PosVelNed;
        }
        self
    }

    #[must_use]
    pub fn with_acceleration(mut self, acceleration: [f64; 3]) -> Self {
        self.acceleration = Some(acceleration);
        if matches!(self.frame, WaypointFrame::PosNed | WaypointFrame::PosVelNed) {
            self.frame = WaypointFrame::PosVelAccNed;
        }
        self
    }

    #[must_use]
    pub fn with_yaw(mut self, yaw: f64) -> Self {
        self.yaw = Some(yaw);
        self
    }
}
