//! Wire protocol vocabulary shared by links, the relay and vehicles.
//!
//! Frames are MAVLink v2 messages decoded with the `mavlink` crate's
//! `ardupilotmega` dialect, which is a superset of `common`. The detected
//! [`Dialect`] is reported for the operator's benefit; decoding always uses
//! the superset.

pub mod address;
pub mod params;

pub use address::{AddressError, LinkAddress};
pub use mavlink::ardupilotmega as mav;

use std::fmt;

use mavlink::{MavHeader, Message};
use serde::{Deserialize, Serialize};

use mav::{
    MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavResult, MavState, MavType,
    PositionTargetTypemask, COMMAND_ACK_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
    MANUAL_CONTROL_DATA, PING_DATA, SET_POSITION_TARGET_LOCAL_NED_DATA,
};

/// Message ids the fleet core handles explicitly.
pub mod ids {
    pub const HEARTBEAT: u32 = 0;
    pub const PING: u32 = 4;
    pub const ATTITUDE: u32 = 30;
    pub const LOCAL_POSITION_NED: u32 = 32;
    pub const MANUAL_CONTROL: u32 = 69;
    pub const COMMAND_LONG: u32 = 76;
    pub const COMMAND_ACK: u32 = 77;
    pub const SET_POSITION_TARGET_LOCAL_NED: u32 = 84;
    pub const AUTOPILOT_VERSION: u32 = 148;
    pub const CAMERA_IMAGE_CAPTURED: u32 = 263;
    pub const PARAM_EXT_REQUEST_READ: u32 = 320;
    pub const PARAM_EXT_REQUEST_LIST: u32 = 321;
    pub const PARAM_EXT_VALUE: u32 = 322;
    pub const PARAM_EXT_SET: u32 = 323;
    pub const PARAM_EXT_ACK: u32 = 324;
}

/// MAVLink protocol version advertised in heartbeats.
const MAVLINK_VERSION: u8 = 3;

/// A (system, component) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    pub system_id: u8,
    pub component_id: u8,
}

impl Identity {
    pub const fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            system_id,
            component_id,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system_id, self.component_id)
    }
}

/// Message dictionary variant, by firmware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    ArduPilotMega,
    CubePilot,
    Common,
}

impl Dialect {
    /// Dialect implied by the autopilot type in a heartbeat, if known.
    pub fn from_autopilot(autopilot: MavAutopilot) -> Option<Self> {
        match autopilot {
            MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA => Some(Self::ArduPilotMega),
            MavAutopilot::MAV_AUTOPILOT_PX4 => Some(Self::CubePilot),
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::ArduPilotMega => write!(f, "ardupilotmega"),
            Dialect::CubePilot => write!(f, "cubepilot"),
            Dialect::Common => write!(f, "common"),
        }
    }
}

/// One decoded message with the header of its true sender.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MavHeader,
    pub message: MavMessage,
}

impl Frame {
    pub fn new(source: Identity, message: MavMessage) -> Self {
        Self {
            header: MavHeader {
                system_id: source.system_id,
                component_id: source.component_id,
                sequence: 0,
            },
            message,
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.header.sequence = sequence;
        self
    }

    pub fn message_id(&self) -> u32 {
        self.message.message_id()
    }

    pub fn source(&self) -> Identity {
        Identity::new(self.header.system_id, self.header.component_id)
    }

    /// Serialize as a MAVLink v2 packet.
    pub fn encode(&self) -> Result<Vec<u8>, mavlink::error::MessageWriteError> {
        let mut buf = Vec::with_capacity(64);
        mavlink::write_v2_msg(&mut buf, self.header, &self.message)?;
        Ok(buf)
    }
}

// ============================================================================
// Message builders
// ============================================================================

pub fn heartbeat(mavtype: MavType, autopilot: MavAutopilot, armed: bool) -> MavMessage {
    let base_mode = if armed {
        MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
    } else {
        MavModeFlag::empty()
    };
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype,
        autopilot,
        base_mode,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: MAVLINK_VERSION,
    })
}

/// Heartbeat the relay emits on both links: a ground station with no autopilot.
pub fn relay_heartbeat() -> MavMessage {
    heartbeat(
        MavType::MAV_TYPE_GCS,
        MavAutopilot::MAV_AUTOPILOT_INVALID,
        false,
    )
}

pub fn ping(seq: u32, time_usec: u64) -> MavMessage {
    MavMessage::PING(PING_DATA {
        time_usec,
        seq,
        target_system: 0,
        target_component: 0,
    })
}

pub fn command_long(target: Identity, command: MavCmd, params: [f32; 7]) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        param1: params[0],
        param2: params[1],
        param3: params[2],
        param4: params[3],
        param5: params[4],
        param6: params[5],
        param7: params[6],
        command,
        target_system: target.system_id,
        target_component: target.component_id,
        confirmation: 0,
    })
}

/// Ack addressed back to the sender of a command.
pub fn command_ack(command: MavCmd, result: MavResult, requester: Identity) -> MavMessage {
    MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
        command,
        result,
        target_system: requester.system_id,
        target_component: requester.component_id,
        ..Default::default()
    })
}

/// Local NED setpoint. Absent velocity, acceleration or yaw are flagged as
/// ignored in the type mask.
pub fn position_target_local_ned(
    target: Identity,
    position: [f32; 3],
    velocity: Option<[f32; 3]>,
    acceleration: Option<[f32; 3]>,
    yaw: Option<f32>,
) -> MavMessage {
    const IGNORE_VELOCITY: u16 = 0b0000_0011_1000;
    const IGNORE_ACCELERATION: u16 = 0b0001_1100_0000;
    const IGNORE_YAW: u16 = 0b0100_0000_0000;
    const IGNORE_YAW_RATE: u16 = 0b1000_0000_0000;

    let mut mask = IGNORE_YAW_RATE;
    if velocity.is_none() {
        mask |= IGNORE_VELOCITY;
    }
    if acceleration.is_none() {
        mask |= IGNORE_ACCELERATION;
    }
    if yaw.is_none() {
        mask |= IGNORE_YAW;
    }
    let [vx, vy, vz] = velocity.unwrap_or_default();
    let [afx, afy, afz] = acceleration.unwrap_or_default();

    MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
        time_boot_ms: 0,
        x: position[0],
        y: position[1],
        z: position[2],
        vx,
        vy,
        vz,
        afx,
        afy,
        afz,
        yaw: yaw.unwrap_or_default(),
        yaw_rate: 0.0,
        type_mask: PositionTargetTypemask::from_bits_truncate(mask),
        target_system: target.system_id,
        target_component: target.component_id,
        coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
    })
}

/// Stick input scaled to MANUAL_CONTROL's ±1000 range. Thrust is centred
/// at 500 so that zero vertical intent holds altitude.
pub fn manual_control(target_system: u8, forward: f64, right: f64, vertical: f64, yaw: f64) -> MavMessage {
    #[allow(clippy::cast_possible_truncation)]
    fn axis(value: f64, scale: f64, offset: f64) -> i16 {
        (offset + value.clamp(-1.0, 1.0) * scale).round() as i16
    }
    MavMessage::MANUAL_CONTROL(MANUAL_CONTROL_DATA {
        x: axis(forward, 1000.0, 0.0),
        y: axis(right, 1000.0, 0.0),
        z: axis(vertical, 500.0, 500.0),
        r: axis(yaw, 1000.0, 0.0),
        buttons: 0,
        target: target_system,
        ..Default::default()
    })
}

/// Armed flag carried in a heartbeat's base mode.
pub fn heartbeat_armed(data: &HEARTBEAT_DATA) -> bool {
    data.base_mode
        .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED)
}
