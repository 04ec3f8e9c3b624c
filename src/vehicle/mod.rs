//! Vehicle handle
//!
//! A [`Vehicle`] owns one [`ProtocolRelay`], an optional [`Fence`], a
//! telemetry snapshot kept current through relay callbacks, and a serial
//! executor for scheduled actions. Lifecycle:
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnecting → Disconnected
//! ```
//!
//! A handle is single use: once shut down it cannot reconnect. The fleet
//! creates a fresh one per connect request.

mod executor;
mod telemetry;

pub use executor::SerialExecutor;
pub use telemetry::{Attitude, Telemetry};

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Span};

use crate::background::{isolate, JobGroup};
use crate::config::defaults::AUTOPILOT_COMPONENT_ID;
use crate::config::{RelayConfig, VehicleConfig};
use crate::governor::{Fence, ManualInput, SpeedLimits, Waypoint, WaypointFrame};
use crate::link::LinkFactory;
use crate::protocol::mav::{MavCmd, MavMessage, ParamAck};
use crate::protocol::params::{decode_param_id, ParamError, ParamRef, ParamValue};
use crate::protocol::{self, ids, Frame, Identity, LinkAddress};
use crate::relay::{callback, ProtocolRelay, RelayError};
use crate::sync::{lock, read, write};

#[derive(Debug, Error)]
pub enum VehicleError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("{vehicle}: {command} was rejected")]
    CommandRejected { vehicle: String, command: String },

    #[error("{vehicle}: waypoint {position:?} is outside the fence")]
    FenceViolation { vehicle: String, position: [f64; 3] },

    #[error("{0} is armed, refusing to disconnect")]
    Armed(String),

    #[error("{0} is not connected")]
    NotConnected(String),

    #[error("global waypoints are not supported, use a local NED frame")]
    UnsupportedFrame,

    #[error(transparent)]
    Param(#[from] ParamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

pub struct Vehicle {
    name: String,
    address: LinkAddress,
    relay_address: LinkAddress,
    config: VehicleConfig,
    relay: Arc<ProtocolRelay>,
    state: Mutex<LinkState>,
    fence: RwLock<Option<Fence>>,
    telemetry: Arc<Mutex<Telemetry>>,
    executor: Mutex<Option<SerialExecutor>>,
    jobs: JobGroup,
    span: Span,
}

impl fmt::Debug for Vehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vehicle")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("relay_address", &self.relay_address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Vehicle {
    /// `address` is where the autopilot talks; `relay_address` is where the
    /// operator-facing side of the relay sends.
    pub fn new(
        name: &str,
        address: LinkAddress,
        relay_address: LinkAddress,
        relay_config: RelayConfig,
        config: VehicleConfig,
        transport: Arc<dyn LinkFactory>,
    ) -> Arc<Self> {
        let span = info_span!("vehicle", name = %name);
        let relay = ProtocolRelay::new(relay_config, transport, span.clone());
        Arc::new(Self {
            name: name.to_string(),
            address,
            relay_address,
            config,
            relay,
            state: Mutex::new(LinkState::Disconnected),
            fence: RwLock::new(None),
            telemetry: Arc::new(Mutex::new(Telemetry::default())),
            executor: Mutex::new(None),
            jobs: JobGroup::new(span.clone()),
            span,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Handshake with the autopilot, open the operator side and start the
    /// telemetry callbacks and executor. On failure everything started so
    /// far is stopped again.
    pub async fn connect(&self, timeout: Duration) -> Result<(), VehicleError> {
        self.set_state(LinkState::Connecting);
        match self.establish(timeout).await {
            Ok(()) => {
                self.set_state(LinkState::Connected);
                info!(parent: &self.span, address = %self.address, relay = %self.relay_address, "✓ Vehicle ready");
                Ok(())
            }
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn establish(&self, timeout: Duration) -> Result<(), VehicleError> {
        self.relay.connect_vehicle(&self.address, timeout).await?;
        self.relay.connect_operator(&self.relay_address).await?;

        for msg_id in [ids::HEARTBEAT, ids::ATTITUDE, ids::LOCAL_POSITION_NED] {
            let telemetry = Arc::clone(&self.telemetry);
            self.relay.add_callback(
                msg_id,
                callback(move |frame: Frame| {
                    let telemetry = Arc::clone(&telemetry);
                    async move {
                        lock(&telemetry).apply(&frame);
                        Ok(())
                    }
                }),
            );
        }
        *lock(&self.executor) = Some(SerialExecutor::start(&self.jobs));
        Ok(())
    }

    /// Disconnect unless armed. `force` disconnects regardless.
    pub async fn disconnect(&self, force: bool) -> Result<(), VehicleError> {
        if self.is_armed() && !force {
            warn!(parent: &self.span, "Refusing to disconnect an armed vehicle");
            return Err(VehicleError::Armed(self.name.clone()));
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop the executor and relay. Idempotent and infallible.
    pub async fn shutdown(&self) {
        self.set_state(LinkState::Disconnecting);
        lock(&self.executor).take();
        self.jobs.shutdown().await;
        self.relay.stop().await;
        self.set_state(LinkState::Disconnected);
        debug!(parent: &self.span, "Vehicle shut down");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Send a command to the autopilot and require an accepting ack within
    /// the command timeout.
    pub async fn command(&self, command: MavCmd, params: &[f32]) -> Result<(), VehicleError> {
        let ack = self
            .relay
            .send_command(AUTOPILOT_COMPONENT_ID, command, params)
            .await?;
        if ack.wait(self.config.command_timeout()).await? {
            Ok(())
        } else {
            warn!(parent: &self.span, ?command, "Command rejected");
            Err(VehicleError::CommandRejected {
                vehicle: self.name.clone(),
                command: format!("{command:?}"),
            })
        }
    }

    pub async fn arm(&self) -> Result<(), VehicleError> {
        self.command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, &[1.0])
            .await?;
        lock(&self.telemetry).armed = true;
        info!(parent: &self.span, "Armed");
        Ok(())
    }

    pub async fn disarm(&self) -> Result<(), VehicleError> {
        self.command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, &[0.0])
            .await?;
        lock(&self.telemetry).armed = false;
        info!(parent: &self.span, "Disarmed");
        Ok(())
    }

    /// Take off to `altitude` metres above the home position.
    pub async fn takeoff(&self, altitude: f32) -> Result<(), VehicleError> {
        self.command(
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            &[0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, altitude],
        )
        .await
    }

    pub async fn land(&self) -> Result<(), VehicleError> {
        self.command(MavCmd::MAV_CMD_NAV_LAND, &[0.0, 0.0, 0.0, f32::NAN])
            .await
    }

    /// Drop every scheduled action, abort the running one and, if armed,
    /// land where the vehicle is.
    pub async fn stop(&self) -> Result<(), VehicleError> {
        if let Some(executor) = lock(&self.executor).clone() {
            executor.clear();
        }
        warn!(parent: &self.span, "Stopping");
        if self.is_armed() {
            self.land().await?;
        }
        Ok(())
    }

    /// Drop every scheduled action and terminate flight. Motors stop
    /// immediately; the vehicle falls if airborne.
    pub async fn kill(&self) -> Result<(), VehicleError> {
        if let Some(executor) = lock(&self.executor).clone() {
            executor.clear();
        }
        warn!(parent: &self.span, "Terminating flight");
        self.command(MavCmd::MAV_CMD_DO_FLIGHTTERMINATION, &[1.0])
            .await?;
        lock(&self.telemetry).armed = false;
        Ok(())
    }

    /// Fly to a local NED waypoint. With an active fence the waypoint must
    /// lie strictly inside it.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn goto(&self, waypoint: &Waypoint) -> Result<(), VehicleError> {
        if waypoint.frame == WaypointFrame::Global {
            return Err(VehicleError::UnsupportedFrame);
        }
        if let Some(fence) = self.fence().filter(Fence::is_active) {
            if !fence.waypoint_admissible(waypoint) {
                warn!(parent: &self.span, position = ?waypoint.position, "Waypoint rejected by fence");
                return Err(VehicleError::FenceViolation {
                    vehicle: self.name.clone(),
                    position: waypoint.position,
                });
            }
        }

        let target = self.autopilot()?;
        let narrow = |v: [f64; 3]| v.map(|x| x as f32);
        let message = protocol::position_target_local_ned(
            target,
            narrow(waypoint.position),
            waypoint.velocity.map(narrow),
            waypoint.acceleration.map(narrow),
            waypoint.yaw.map(|y| y as f32),
        );
        self.relay.send_message(message).await?;
        debug!(parent: &self.span, position = ?waypoint.position, "Setpoint sent");
        Ok(())
    }

    /// Clamp `input` against the fence and send it. Returns what was sent.
    pub async fn manual_control(&self, input: ManualInput) -> Result<ManualInput, VehicleError> {
        let target = self.autopilot()?;
        let clamped = match self.fence() {
            Some(fence) => fence.clamp_manual_input(
                &lock(&self.telemetry).pose(),
                input,
                &SpeedLimits::from(&self.config),
                self.config.control_period(),
            ),
            None => input,
        };
        let message = protocol::manual_control(
            target.system_id,
            clamped.forward,
            clamped.right,
            clamped.vertical,
            clamped.yaw,
        );
        self.relay.send_message(message).await?;
        Ok(clamped)
    }

    // ========================================================================
    // Messages & parameters
    // ========================================================================

    /// Ask the autopilot for one `msg_id` message.
    pub async fn request_message(&self, msg_id: u32, params: &[f32]) -> Result<Frame, VehicleError> {
        Ok(self
            .relay
            .request_message(
                AUTOPILOT_COMPONENT_ID,
                msg_id,
                params,
                self.relay.request_timeout(),
            )
            .await?)
    }

    /// Read one extended parameter from `component`.
    pub async fn read_parameter(
        &self,
        component: u8,
        param: &ParamRef,
    ) -> Result<(String, ParamValue), VehicleError> {
        let waiter = self.relay.listen_message(ids::PARAM_EXT_VALUE, component)?;
        self.relay.param_ext_request_read(component, param).await?;
        let frame = waiter.wait(self.relay.request_timeout()).await?;
        match frame.message {
            MavMessage::PARAM_EXT_VALUE(value) => Ok((
                decode_param_id(&value.param_id),
                ParamValue::decode(value.param_type, &value.param_value)?,
            )),
            _ => Err(RelayError::CorrelationMismatch {
                what: format!("parameter read {param:?}"),
            }
            .into()),
        }
    }

    /// Write one extended parameter on `component` and require it accepted.
    pub async fn set_parameter(&self, component: u8, id: &str, value: ParamValue) -> Result<(), VehicleError> {
        let waiter = self.relay.listen_message(ids::PARAM_EXT_ACK, component)?;
        self.relay.param_ext_set(component, id, value).await?;
        let frame = waiter.wait(self.relay.request_timeout()).await?;
        match frame.message {
            MavMessage::PARAM_EXT_ACK(ack) if ack.param_result == ParamAck::PARAM_ACK_ACCEPTED => {
                debug!(parent: &self.span, id, ?value, "Parameter set");
                Ok(())
            }
            _ => Err(VehicleError::CommandRejected {
                vehicle: self.name.clone(),
                command: format!("PARAM_EXT_SET {id}"),
            }),
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run `action` now, isolated. Cancelled if the vehicle shuts down.
    pub async fn execute<F, T>(&self, action: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
    {
        let token = self.jobs.token();
        tokio::select! {
            () = token.cancelled() => Err(anyhow!("{} shut down", self.name)),
            result = isolate(action) => result,
        }
    }

    /// Queue `action` behind earlier scheduled actions on this vehicle.
    pub async fn schedule<F, T>(&self, action: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.executor()?.schedule(action).await
    }

    /// Hold scheduled actions back; the running one completes.
    pub fn pause(&self) -> Result<(), VehicleError> {
        self.executor()?.pause();
        info!(parent: &self.span, "Scheduled actions paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), VehicleError> {
        self.executor()?.resume();
        info!(parent: &self.span, "Scheduled actions resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.executor)
            .as_ref()
            .is_some_and(SerialExecutor::is_paused)
    }

    fn executor(&self) -> Result<SerialExecutor, VehicleError> {
        lock(&self.executor)
            .clone()
            .ok_or_else(|| VehicleError::NotConnected(self.name.clone()))
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    pub fn relay_address(&self) -> &LinkAddress {
        &self.relay_address
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected && self.relay.connected_to_vehicle()
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.telemetry).armed
    }

    pub fn relay(&self) -> &Arc<ProtocolRelay> {
        &self.relay
    }

    pub fn telemetry(&self) -> Telemetry {
        lock(&self.telemetry).clone()
    }

    pub fn fence(&self) -> Option<Fence> {
        read(&self.fence).clone()
    }

    /// Install or remove the fence.
    pub fn set_fence(&self, fence: Option<Fence>) {
        match &fence {
            Some(f) => info!(
                parent: &self.span,
                north = ?f.north(),
                east = ?f.east(),
                down = ?f.down(),
                level = f.safety_level(),
                "Fence set"
            ),
            None => info!(parent: &self.span, "Fence removed"),
        }
        *write(&self.fence) = fence;
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    fn set_state(&self, state: LinkState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(parent: &self.span, from = %*current, to = %state, "State change");
            *current = state;
        }
    }

    fn autopilot(&self) -> Result<Identity, VehicleError> {
        self.relay
            .vehicle_identity()
            .map(|v| Identity::new(v.system_id, AUTOPILOT_COMPONENT_ID))
            .ok_or_else(|| VehicleError::NotConnected(self.name.clone()))
    }
}
