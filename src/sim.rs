//! In-process simulated autopilots and operators.
//!
//! A [`Simulator`] sits on the far side of a [`MemoryTransport`]. Every
//! vehicle-side link opened at an address with a registered
//! [`SimulatedVehicle`] is served by that vehicle; every operator-side link
//! is served by a simulated ground station that heartbeats and records what
//! it receives. Used by the integration tests and the `demo` command.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::config::defaults::AUTOPILOT_COMPONENT_ID;
use crate::link::{Link, LinkRole, MemoryEndpoint, MemoryLink, MemoryPeers, MemoryTransport, Received};
use crate::protocol::mav::{
    MavAutopilot, MavCmd, MavMessage, MavParamExtType, MavResult, MavType, ParamAck,
    AUTOPILOT_VERSION_DATA, COMMAND_LONG_DATA, LOCAL_POSITION_NED_DATA, PARAM_EXT_ACK_DATA,
    PARAM_EXT_VALUE_DATA,
};
use crate::protocol::params::{decode_param_id, PARAM_VALUE_LEN};
use crate::protocol::{self, ids, Frame, Identity, LinkAddress};
use crate::sync::lock;

const SIM_HEARTBEAT_PERIOD: Duration = Duration::from_millis(50);
const SIM_POSITION_PERIOD: Duration = Duration::from_millis(100);
const SIM_POLL_PERIOD: Duration = Duration::from_millis(2);

/// Ground station identity used by the simulated operator.
pub const SIM_OPERATOR: Identity = Identity::new(255, 190);

/// Firmware version reported in AUTOPILOT_VERSION.
const SIM_FLIGHT_SW_VERSION: u32 = 0x010F_0000;

#[derive(Debug, Default)]
struct SimState {
    armed: bool,
    position: [f32; 3],
    commands: Vec<(MavCmd, [f32; 7])>,
    params: HashMap<String, (MavParamExtType, [u8; PARAM_VALUE_LEN])>,
    last_manual: Option<[i16; 4]>,
    /// Ack results used before falling back to `command_result`.
    scripted: VecDeque<MavResult>,
}

/// A scripted autopilot.
#[derive(Clone)]
pub struct SimulatedVehicle {
    system_id: u8,
    autopilot: MavAutopilot,
    command_result: MavResult,
    answer_commands: bool,
    heartbeat: bool,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedVehicle {
    fn default() -> Self {
        Self {
            system_id: 1,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            command_result: MavResult::MAV_RESULT_ACCEPTED,
            answer_commands: true,
            heartbeat: true,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }
}

impl SimulatedVehicle {
    pub fn new(system_id: u8) -> Self {
        Self {
            system_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_autopilot(mut self, autopilot: MavAutopilot) -> Self {
        self.autopilot = autopilot;
        self
    }

    /// Result carried by every command ack.
    #[must_use]
    pub fn with_command_result(mut self, result: MavResult) -> Self {
        self.command_result = result;
        self
    }

    /// Ack the next commands with `results` in order, then fall back to
    /// the configured result.
    #[must_use]
    pub fn with_scripted_results(self, results: impl IntoIterator<Item = MavResult>) -> Self {
        lock(&self.state).scripted.extend(results);
        self
    }

    /// Never ack or answer commands.
    #[must_use]
    pub fn unresponsive(mut self) -> Self {
        self.answer_commands = false;
        self
    }

    /// Never send heartbeats, so no handshake can complete.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.heartbeat = false;
        self
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.system_id, AUTOPILOT_COMPONENT_ID)
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.state).armed
    }

    pub fn position(&self) -> [f32; 3] {
        lock(&self.state).position
    }

    /// Every COMMAND_LONG received, in order.
    pub fn commands(&self) -> Vec<MavCmd> {
        lock(&self.state).commands.iter().map(|(cmd, _)| *cmd).collect()
    }

    /// Parameters of the most recent `command` received.
    pub fn command_params(&self, command: MavCmd) -> Option<[f32; 7]> {
        lock(&self.state)
            .commands
            .iter()
            .rev()
            .find(|(cmd, _)| *cmd == command)
            .map(|(_, params)| *params)
    }

    /// Last MANUAL_CONTROL as `[x, y, z, r]`.
    pub fn last_manual(&self) -> Option<[i16; 4]> {
        lock(&self.state).last_manual
    }

    async fn serve(self, link: MemoryLink, token: CancellationToken) {
        let me = self.identity();
        let mut next_heartbeat = Instant::now();
        let mut next_position = Instant::now();
        loop {
            if token.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if self.heartbeat && now >= next_heartbeat {
                let armed = self.is_armed();
                let hb = protocol::heartbeat(MavType::MAV_TYPE_QUADROTOR, self.autopilot, armed);
                if link.send(&Frame::new(me, hb)).await.is_err() {
                    return;
                }
                next_heartbeat = now + SIM_HEARTBEAT_PERIOD;
            }
            if self.heartbeat && now >= next_position {
                if link.send(&Frame::new(me, self.local_position())).await.is_err() {
                    return;
                }
                next_position = now + SIM_POSITION_PERIOD;
            }

            loop {
                match link.try_recv() {
                    Ok(Some(Received::Frame(frame))) => {
                        for reply in self.handle(&frame) {
                            if link.send(&Frame::new(me, reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Some(Received::Unrecognized { .. })) => {}
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
            tokio::time::sleep(SIM_POLL_PERIOD).await;
        }
    }

    fn local_position(&self) -> MavMessage {
        let [x, y, z] = self.position();
        MavMessage::LOCAL_POSITION_NED(LOCAL_POSITION_NED_DATA {
            x,
            y,
            z,
            ..Default::default()
        })
    }

    /// Replies to one inbound frame.
    fn handle(&self, frame: &Frame) -> Vec<MavMessage> {
        if !self.answer_commands {
            return Vec::new();
        }
        let requester = frame.source();
        match &frame.message {
            MavMessage::COMMAND_LONG(cmd) if cmd.target_system == self.system_id => {
                trace!(command = ?cmd.command, "Sim command");
                self.command(cmd, requester)
            }
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(target) if target.target_system == self.system_id => {
                lock(&self.state).position = [target.x, target.y, target.z];
                Vec::new()
            }
            MavMessage::MANUAL_CONTROL(input) if input.target == self.system_id => {
                lock(&self.state).last_manual = Some([input.x, input.y, input.z, input.r]);
                Vec::new()
            }
            MavMessage::PARAM_EXT_REQUEST_READ(req) if req.target_system == self.system_id => {
                let id = decode_param_id(&req.param_id);
                let state = lock(&self.state);
                state
                    .params
                    .get(&id)
                    .map(|(param_type, value)| {
                        MavMessage::PARAM_EXT_VALUE(PARAM_EXT_VALUE_DATA {
                            param_count: u16::try_from(state.params.len()).unwrap_or(u16::MAX),
                            param_index: 0,
                            param_id: req.param_id,
                            param_value: *value,
                            param_type: *param_type,
                        })
                    })
                    .into_iter()
                    .collect()
            }
            MavMessage::PARAM_EXT_SET(set) if set.target_system == self.system_id => {
                let id = decode_param_id(&set.param_id);
                lock(&self.state)
                    .params
                    .insert(id, (set.param_type, set.param_value));
                vec![MavMessage::PARAM_EXT_ACK(PARAM_EXT_ACK_DATA {
                    param_id: set.param_id,
                    param_value: set.param_value,
                    param_type: set.param_type,
                    param_result: ParamAck::PARAM_ACK_ACCEPTED,
                })]
            }
            _ => Vec::new(),
        }
    }

    fn command(&self, cmd: &COMMAND_LONG_DATA, requester: Identity) -> Vec<MavMessage> {
        let mut state = lock(&self.state);
        let result = state.scripted.pop_front().unwrap_or(self.command_result);
        let accepted = result == MavResult::MAV_RESULT_ACCEPTED;
        let mut replies = vec![protocol::command_ack(cmd.command, result, requester)];
        state.commands.push((
            cmd.command,
            [cmd.param1, cmd.param2, cmd.param3, cmd.param4, cmd.param5, cmd.param6, cmd.param7],
        ));
        if !accepted {
            return replies;
        }
        match cmd.command {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => state.armed = cmd.param1 > 0.5,
            MavCmd::MAV_CMD_NAV_TAKEOFF => state.position[2] = -cmd.param7,
            MavCmd::MAV_CMD_NAV_LAND => state.position[2] = 0.0,
            MavCmd::MAV_CMD_DO_FLIGHTTERMINATION => state.armed = false,
            MavCmd::MAV_CMD_REQUEST_MESSAGE => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let msg_id = cmd.param1 as u32;
                let armed = state.armed;
                let [x, y, z] = state.position;
                let message = match msg_id {
                    ids::AUTOPILOT_VERSION => Some(MavMessage::AUTOPILOT_VERSION(AUTOPILOT_VERSION_DATA {
                        flight_sw_version: SIM_FLIGHT_SW_VERSION,
                        ..Default::default()
                    })),
                    ids::HEARTBEAT => Some(protocol::heartbeat(
                        MavType::MAV_TYPE_QUADROTOR,
                        self.autopilot,
                        armed,
                    )),
                    ids::LOCAL_POSITION_NED => Some(MavMessage::LOCAL_POSITION_NED(LOCAL_POSITION_NED_DATA {
                        x,
                        y,
                        z,
                        ..Default::default()
                    })),
                    _ => None,
                };
                replies.extend(message);
            }
            _ => {}
        }
        replies
    }
}

/// What the simulated operator has received, per (message id, sender).
#[derive(Debug, Default)]
struct OperatorLog {
    received: HashMap<(u32, Identity), usize>,
}

pub struct Simulator {
    vehicles: Mutex<HashMap<String, SimulatedVehicle>>,
    operator: Arc<Mutex<OperatorLog>>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Simulator {
    /// A transport to hand to the fleet, and the simulator serving its far
    /// ends.
    pub fn start() -> (Arc<MemoryTransport>, Arc<Self>) {
        let (transport, peers) = MemoryTransport::new();
        let sim = Arc::new(Self {
            vehicles: Mutex::new(HashMap::new()),
            operator: Arc::new(Mutex::new(OperatorLog::default())),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        });
        let accept = Arc::clone(&sim);
        sim.tracker.spawn(async move { accept.accept_loop(peers).await });
        (Arc::new(transport), sim)
    }

    /// Serve vehicle-side links opened at `address` with `vehicle`.
    pub fn add_vehicle(&self, address: &LinkAddress, vehicle: SimulatedVehicle) {
        lock(&self.vehicles).insert(address.location_key(), vehicle);
    }

    /// Messages of `msg_id` from `source` that reached any operator link.
    pub fn operator_received(&self, msg_id: u32, source: Identity) -> usize {
        lock(&self.operator)
            .received
            .get(&(msg_id, source))
            .copied()
            .unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn accept_loop(self: Arc<Self>, mut peers: MemoryPeers) {
        loop {
            let endpoint = tokio::select! {
                () = self.token.cancelled() => return,
                endpoint = peers.accept() => endpoint,
            };
            let Some(endpoint) = endpoint else { return };
            self.route(endpoint);
        }
    }

    fn route(&self, endpoint: MemoryEndpoint) {
        let MemoryEndpoint { address, role, link } = endpoint;
        let token = self.token.child_token();
        match role {
            LinkRole::Vehicle => {
                let vehicle = lock(&self.vehicles).get(&address.location_key()).cloned();
                match vehicle {
                    Some(vehicle) => {
                        debug!(%address, "Sim vehicle link opened");
                        self.tracker.spawn(vehicle.serve(link, token));
                    }
                    None => debug!(%address, "No sim vehicle at address, link left idle"),
                }
            }
            LinkRole::Operator => {
                debug!(%address, "Sim operator link opened");
                self.tracker
                    .spawn(serve_operator(link, Arc::clone(&self.operator), token));
            }
        }
    }
}

async fn serve_operator(link: MemoryLink, log: Arc<Mutex<OperatorLog>>, token: CancellationToken) {
    let mut next_heartbeat = Instant::now();
    loop {
        if token.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now >= next_heartbeat {
            let hb = Frame::new(SIM_OPERATOR, protocol::relay_heartbeat());
            if link.send(&hb).await.is_err() {
                return;
            }
            next_heartbeat = now + SIM_HEARTBEAT_PERIOD;
        }
        loop {
            match link.try_recv() {
                Ok(Some(Received::Frame(frame))) => {
                    *lock(&log)
                        .received
                        .entry((frame.message_id(), frame.source()))
                        .or_default() += 1;
                }
                Ok(Some(Received::Unrecognized { .. })) => {}
                Ok(None) => break,
                Err(_) => return,
            }
        }
        tokio::time::sleep(SIM_POLL_PERIOD).await;
    }
}
