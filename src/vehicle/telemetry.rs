//! Latest known vehicle state, folded from relayed messages.

use chrono::{DateTime, Utc};

use crate::config::defaults::AUTOPILOT_COMPONENT_ID;
use crate::governor::VehiclePose;
use crate::protocol::mav::{MavAutopilot, MavMessage};
use crate::protocol::{heartbeat_armed, Frame};

/// Roll, pitch and yaw in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    /// Local NED position (m)
    pub position: Option<[f64; 3]>,
    /// Local NED velocity (m/s)
    pub velocity: Option<[f64; 3]>,
    pub attitude: Option<Attitude>,
    pub armed: bool,
    pub autopilot: Option<MavAutopilot>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Telemetry {
    /// Fold one message into the snapshot. Only the autopilot component's
    /// messages count; anything else is ignored.
    pub fn apply(&mut self, frame: &Frame) {
        if frame.header.component_id != AUTOPILOT_COMPONENT_ID {
            return;
        }
        match &frame.message {
            MavMessage::HEARTBEAT(hb) => {
                self.armed = heartbeat_armed(hb);
                self.autopilot = Some(hb.autopilot);
                self.last_heartbeat = Some(Utc::now());
            }
            MavMessage::ATTITUDE(att) => {
                self.attitude = Some(Attitude {
                    roll: f64::from(att.roll),
                    pitch: f64::from(att.pitch),
                    yaw: f64::from(att.yaw),
                });
            }
            MavMessage::LOCAL_POSITION_NED(pos) => {
                self.position = Some([f64::from(pos.x), f64::from(pos.y), f64::from(pos.z)]);
                self.velocity = Some([f64::from(pos.vx), f64::from(pos.vy), f64::from(pos.vz)]);
            }
            _ => {}
        }
    }

    /// Pose for fence clamping. Unknown position or heading reads as the
    /// origin facing north.
    pub fn pose(&self) -> VehiclePose {
        VehiclePose {
            position: self.position.unwrap_or_default(),
            heading: self.attitude.map(|a| a.yaw).unwrap_or_default(),
        }
    }

    /// Heading in degrees, `[0, 360)`.
    pub fn heading_deg(&self) -> Option<f64> {
        self.attitude
            .map(|a| a.yaw.to_degrees().rem_euclid(360.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mav::{MavType, ATTITUDE_DATA, LOCAL_POSITION_NED_DATA};
    use crate::protocol::{heartbeat, Identity};

    fn from_autopilot(message: MavMessage) -> Frame {
        Frame::new(Identity::new(1, AUTOPILOT_COMPONENT_ID), message)
    }

    #[test]
    fn test_folds_heartbeat_position_and_attitude() {
        let mut t = Telemetry::default();
        t.apply(&from_autopilot(heartbeat(
            MavType::MAV_TYPE_QUADROTOR,
            MavAutopilot::MAV_AUTOPILOT_PX4,
            true,
        )));
        assert!(t.armed);
        assert_eq!(t.autopilot, Some(MavAutopilot::MAV_AUTOPILOT_PX4));
        assert!(t.last_heartbeat.is_some());

        t.apply(&from_autopilot(MavMessage::LOCAL_POSITION_NED(LOCAL_POSITION_NED_DATA {
            x: 1.5,
            y: -2.0,
            z: -3.0,
            vx: 0.5,
            ..Default::default()
        })));
        assert_eq!(t.position, Some([1.5, -2.0, -3.0]));
        assert_eq!(t.velocity, Some([0.5, 0.0, 0.0]));

        t.apply(&from_autopilot(MavMessage::ATTITUDE(ATTITUDE_DATA {
            yaw: -std::f32::consts::FRAC_PI_2,
            ..Default::default()
        })));
        let heading = t.heading_deg().unwrap();
        assert!((heading - 270.0).abs() < 1e-3, "heading = {heading}");
        assert_eq!(t.pose().position, [1.5, -2.0, -3.0]);
    }

    #[test]
    fn test_ignores_other_components() {
        let mut t = Telemetry::default();
        let camera = Frame::new(
            Identity::new(1, 100),
            heartbeat(MavType::MAV_TYPE_CAMERA, MavAutopilot::MAV_AUTOPILOT_INVALID, true),
        );
        t.apply(&camera);
        assert!(!t.armed);
        assert!(t.autopilot.is_none());
        assert_eq!(t.pose(), VehiclePose::default());
    }
}
