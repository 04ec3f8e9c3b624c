//! Protocol Relay
//!
//! One relay per vehicle. It owns a vehicle-facing and an operator-facing
//! link and forwards traffic both ways with each message's true sender
//! header, so the operator sees the vehicle directly and the relay never
//! appears as origin.
//!
//! On top of the forwarding it provides:
//! - liveness: heartbeats and pings on both links, last-seen timestamps
//! - dialect detection from the autopilot's heartbeat
//! - correlated `send_command` / `request_message`
//! - persistent callbacks per message id
//!
//! ## Jobs
//!
//! | Job                 | Started by          |
//! |---------------------|---------------------|
//! | `VehicleHeartbeat`  | `connect_vehicle`   |
//! | `VehiclePing`       | `connect_vehicle`   |
//! | `VehicleRelay`      | `connect_vehicle`   |
//! | `OperatorHeartbeat` | `connect_operator`  |
//! | `OperatorHandshake` | `connect_operator`  |
//! | `OperatorPing`      | operator handshake  |
//! | `OperatorRelay`     | operator handshake  |
//!
//! Jobs hold only a weak reference to the relay; dropping the last handle
//! cancels them.

mod callbacks;
mod correlation;
mod error;

pub use callbacks::{callback, CallbackId, CallbackRegistry, MessageCallback};
pub use correlation::{AckKey, AckWaiter, CorrelationTables, MessageKey, MessageWaiter};
pub use error::RelayError;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn, Span};

use crate::background::{isolate, JobGroup, JobName};
use crate::config::defaults::AUTOPILOT_COMPONENT_ID;
use crate::config::RelayConfig;
use crate::link::{Link, LinkFactory, LinkRole, Received};
use crate::protocol::mav::{MavAutopilot, MavCmd, MavMessage, MavResult};
use crate::protocol::params::{self, ParamRef, ParamValue};
use crate::protocol::{self, Dialect, Frame, Identity, LinkAddress};
use crate::sync::{lock, read, write};

/// `MAV_CMD_REQUEST_MESSAGE` takes the message id plus five
/// message-specific parameters and a response target.
const REQUEST_MESSAGE_PARAMS: usize = 5;

/// Ask for the response to be sent to the requester's address.
const RESPONSE_TARGET_REQUESTER: f32 = 1.0;

/// What the relay has learned about its peers.
#[derive(Debug, Default, Clone, Copy)]
struct Peers {
    vehicle: Option<Identity>,
    operator: Option<Identity>,
    autopilot: Option<MavAutopilot>,
    dialect: Option<Dialect>,
}

pub struct ProtocolRelay {
    config: RelayConfig,
    identity: Identity,
    transport: Arc<dyn LinkFactory>,
    vehicle_link: RwLock<Option<Arc<dyn Link>>>,
    operator_link: RwLock<Option<Arc<dyn Link>>>,
    peers: Mutex<Peers>,
    vehicle_seen: Mutex<Option<Instant>>,
    operator_seen: Mutex<Option<Instant>>,
    correlation: Mutex<CorrelationTables>,
    callbacks: CallbackRegistry,
    jobs: JobGroup,
    stopped: AtomicBool,
    sequence: AtomicU8,
    ping_seq: AtomicU32,
    span: Span,
}

impl ProtocolRelay {
    /// `span` tags every log line and job of this relay, typically
    /// `info_span!("vehicle", name = ...)`.
    pub fn new(config: RelayConfig, transport: Arc<dyn LinkFactory>, span: Span) -> Arc<Self> {
        let identity = Identity::new(config.system_id, config.component_id);
        let peers = Peers {
            dialect: config.dialect,
            ..Peers::default()
        };
        Arc::new(Self {
            identity,
            transport,
            vehicle_link: RwLock::new(None),
            operator_link: RwLock::new(None),
            peers: Mutex::new(peers),
            vehicle_seen: Mutex::new(None),
            operator_seen: Mutex::new(None),
            correlation: Mutex::new(CorrelationTables::default()),
            callbacks: CallbackRegistry::default(),
            jobs: JobGroup::new(span.clone()),
            stopped: AtomicBool::new(false),
            sequence: AtomicU8::new(0),
            ping_seq: AtomicU32::new(0),
            config,
            span,
        })
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Handshake with the autopilot at `address`, then start relaying.
    ///
    /// A probe link is opened first and heartbeats are sent on it until
    /// `required_heartbeats` autopilot heartbeats arrive. The probe is then
    /// discarded and the final link opened. On any failure, timeout or
    /// cancellation nothing is left running or bound.
    pub async fn connect_vehicle(
        self: &Arc<Self>,
        address: &LinkAddress,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        if self.is_stopped() {
            return Err(RelayError::Stopped);
        }
        info!(parent: &self.span, %address, "Connecting to vehicle");

        let link = match tokio::time::timeout(timeout, self.vehicle_handshake(address)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!(parent: &self.span, %address, error = %e, "Vehicle handshake failed");
                return Err(e);
            }
            Err(_) => {
                warn!(parent: &self.span, %address, ?timeout, "Vehicle handshake timed out");
                return Err(RelayError::ConnectTimeout {
                    address: address.to_string(),
                    timeout,
                });
            }
        };

        *write(&self.vehicle_link) = Some(link);
        *lock(&self.vehicle_seen) = Some(Instant::now());

        let weak = Arc::downgrade(self);
        self.jobs.spawn(
            JobName::VehicleHeartbeat,
            heartbeat_loop(weak.clone(), LinkRole::Vehicle, self.config.heartbeat_period()),
        );
        self.jobs.spawn(
            JobName::VehiclePing,
            ping_loop(weak.clone(), LinkRole::Vehicle, self.config.ping_period()),
        );
        self.jobs
            .spawn(JobName::VehicleRelay, relay_loop(weak, LinkRole::Vehicle));

        let peers = *lock(&self.peers);
        info!(
            parent: &self.span,
            %address,
            vehicle = %peers.vehicle.map(|v| v.to_string()).unwrap_or_default(),
            dialect = %peers.dialect.unwrap_or(Dialect::Common),
            "✓ Vehicle connected"
        );
        Ok(())
    }

    /// Open the operator-facing link and start heartbeating on it. The
    /// operator's identity is learned from its first heartbeat, after which
    /// pings and operator → vehicle relaying start.
    pub async fn connect_operator(self: &Arc<Self>, address: &LinkAddress) -> Result<(), RelayError> {
        if self.is_stopped() {
            return Err(RelayError::Stopped);
        }
        let link = self.transport.open(address, LinkRole::Operator).await?;
        debug!(parent: &self.span, link = %link.describe(), "Operator link opened");
        *write(&self.operator_link) = Some(link);

        let weak = Arc::downgrade(self);
        self.jobs.spawn(
            JobName::OperatorHeartbeat,
            heartbeat_loop(weak.clone(), LinkRole::Operator, self.config.heartbeat_period()),
        );
        self.jobs
            .spawn(JobName::OperatorHandshake, operator_handshake(weak));
        Ok(())
    }

    async fn vehicle_handshake(&self, address: &LinkAddress) -> Result<Arc<dyn Link>, RelayError> {
        let probe = self.transport.open(address, LinkRole::Vehicle).await?;
        let found = self.await_autopilot(probe.as_ref()).await;
        probe.close();
        drop(probe);
        let vehicle = found?;
        debug!(parent: &self.span, %vehicle, "Autopilot found, reopening link");
        Ok(self.transport.open(address, LinkRole::Vehicle).await?)
    }

    /// Probe with heartbeats until enough autopilot heartbeats arrive.
    async fn await_autopilot(&self, probe: &dyn Link) -> Result<Identity, RelayError> {
        let required = self.config.required_heartbeats;
        let mut seen = 0u32;
        let mut next_probe = tokio::time::Instant::now();

        loop {
            if self.is_stopped() {
                return Err(RelayError::Stopped);
            }
            if tokio::time::Instant::now() >= next_probe {
                let frame = self.stamp(self.identity, protocol::relay_heartbeat());
                if let Err(e) = probe.send(&frame).await {
                    debug!(parent: &self.span, error = %e, "Probe heartbeat not sent");
                }
                next_probe += self.config.probe_period();
            }

            loop {
                match probe.try_recv() {
                    Ok(Some(Received::Frame(frame))) => {
                        let MavMessage::HEARTBEAT(hb) = &frame.message else {
                            continue;
                        };
                        let source = frame.source();
                        if source.system_id == self.identity.system_id
                            || source.component_id != AUTOPILOT_COMPONENT_ID
                        {
                            continue;
                        }
                        seen += 1;
                        self.learn_vehicle(source, hb.autopilot);
                        trace!(parent: &self.span, %source, seen, required, "Autopilot heartbeat");
                        if seen >= required {
                            return Ok(source);
                        }
                    }
                    Ok(Some(Received::Unrecognized { .. })) => {}
                    Ok(None) => break,
                    Err(e) => {
                        debug!(parent: &self.span, error = %e, "Probe read failed");
                        break;
                    }
                }
            }
            tokio::time::sleep(self.config.poll_backoff()).await;
        }
    }

    fn learn_vehicle(&self, source: Identity, autopilot: MavAutopilot) {
        let mut peers = lock(&self.peers);
        peers.vehicle = Some(source);
        peers.autopilot = Some(autopilot);
        if self.config.dialect.is_none() {
            peers.dialect = Some(Dialect::from_autopilot(autopilot).unwrap_or(Dialect::Common));
        }
    }

    // ========================================================================
    // Commands & correlation
    // ========================================================================

    /// Send COMMAND_LONG to `target_component` of the vehicle and return a
    /// waiter for its ack. Missing parameters are NaN.
    pub async fn send_command(
        &self,
        target_component: u8,
        command: MavCmd,
        params: &[f32],
    ) -> Result<AckWaiter, RelayError> {
        if params.len() > 7 {
            return Err(RelayError::TooManyParams(params.len()));
        }
        let vehicle = self.require_vehicle()?;
        let link = self.link(LinkRole::Vehicle).ok_or(RelayError::NotConnected(LinkRole::Vehicle))?;
        let sender = self.command_identity();

        let mut padded = [f32::NAN; 7];
        padded[..params.len()].copy_from_slice(params);

        let key = AckKey {
            command: command as u32,
            vehicle_system: vehicle.system_id,
            target_component,
            operator_system: sender.system_id,
            operator_component: sender.component_id,
        };
        let rx = lock(&self.correlation).register_ack(key);

        let target = Identity::new(vehicle.system_id, target_component);
        let frame = self.stamp(sender, protocol::command_long(target, command, padded));
        link.send(&frame).await?;
        debug!(parent: &self.span, command = ?command, %target, "Command sent");
        Ok(AckWaiter::new(key, rx))
    }

    /// Waiter for the next `msg_id` message from `target_component`.
    pub fn listen_message(&self, msg_id: u32, target_component: u8) -> Result<MessageWaiter, RelayError> {
        let vehicle = self.require_vehicle()?;
        let key = MessageKey {
            msg_id,
            system: vehicle.system_id,
            component: target_component,
        };
        let rx = lock(&self.correlation).register_message(key);
        Ok(MessageWaiter::new(key, rx))
    }

    /// Ask the vehicle to emit `msg_id` once and wait for it.
    ///
    /// The message is returned whenever it arrives, ack or not. With only
    /// the ack the call fails with `CorrelationMismatch`; with neither it
    /// fails with `RequestTimeout`.
    pub async fn request_message(
        &self,
        target_component: u8,
        msg_id: u32,
        params: &[f32],
        timeout: Duration,
    ) -> Result<Frame, RelayError> {
        if params.len() > REQUEST_MESSAGE_PARAMS {
            return Err(RelayError::TooManyParams(params.len() + 2));
        }
        #[allow(clippy::cast_precision_loss)]
        let id_param = msg_id as f32;
        let mut command_params = [f32::NAN; 7];
        command_params[0] = id_param;
        command_params[1..=params.len()].copy_from_slice(params);
        command_params[6] = RESPONSE_TARGET_REQUESTER;

        let message = self.listen_message(msg_id, target_component)?;
        let ack = self
            .send_command(target_component, MavCmd::MAV_CMD_REQUEST_MESSAGE, &command_params)
            .await?;

        let (ack, message) = tokio::join!(ack.wait(timeout), message.wait(timeout));
        match (ack, message) {
            (Ok(true), Ok(frame)) => Ok(frame),
            (ack, Ok(frame)) => {
                debug!(
                    parent: &self.span,
                    msg_id,
                    ack = ?ack.ok(),
                    "Requested message arrived without an accepting ack"
                );
                Ok(frame)
            }
            (Ok(accepted), Err(_)) => {
                warn!(parent: &self.span, msg_id, accepted, "Request acknowledged but message never arrived");
                Err(RelayError::CorrelationMismatch {
                    what: format!("request for message {msg_id}"),
                })
            }
            (Err(_), Err(e)) => {
                warn!(parent: &self.span, msg_id, ?timeout, "Neither ack nor message arrived");
                Err(match e {
                    RelayError::Stopped => RelayError::Stopped,
                    _ => RelayError::RequestTimeout {
                        what: format!("message {msg_id}"),
                        timeout,
                    },
                })
            }
        }
    }

    /// Send an arbitrary message to the vehicle, stamped like a command.
    pub async fn send_message(&self, message: MavMessage) -> Result<(), RelayError> {
        let link = self.link(LinkRole::Vehicle).ok_or(RelayError::NotConnected(LinkRole::Vehicle))?;
        let frame = self.stamp(self.command_identity(), message);
        link.send(&frame).await?;
        Ok(())
    }

    pub fn add_callback(&self, msg_id: u32, handler: MessageCallback) -> CallbackId {
        self.callbacks.add(msg_id, handler)
    }

    pub fn remove_callback(&self, msg_id: u32, id: CallbackId) -> bool {
        self.callbacks.remove(msg_id, id)
    }

    // ========================================================================
    // Extended parameters
    // ========================================================================

    pub async fn param_ext_request_list(&self, target_component: u8) -> Result<(), RelayError> {
        let target = self.target(target_component)?;
        self.send_message(params::param_ext_request_list(target)).await
    }

    pub async fn param_ext_request_read(
        &self,
        target_component: u8,
        param: &ParamRef,
    ) -> Result<(), RelayError> {
        let target = self.target(target_component)?;
        self.send_message(params::param_ext_request_read(target, param)?)
            .await
    }

    pub async fn param_ext_set(
        &self,
        target_component: u8,
        id: &str,
        value: ParamValue,
    ) -> Result<(), RelayError> {
        let target = self.target(target_component)?;
        self.send_message(params::param_ext_set(target, id, value)?)
            .await
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn connected_to_vehicle(&self) -> bool {
        self.is_live(LinkRole::Vehicle)
    }

    pub fn connected_to_operator(&self) -> bool {
        self.is_live(LinkRole::Operator)
    }

    pub fn dialect(&self) -> Option<Dialect> {
        lock(&self.peers).dialect
    }

    pub fn autopilot(&self) -> Option<MavAutopilot> {
        lock(&self.peers).autopilot
    }

    pub fn vehicle_identity(&self) -> Option<Identity> {
        lock(&self.peers).vehicle
    }

    pub fn operator_identity(&self) -> Option<Identity> {
        lock(&self.peers).operator
    }

    /// Default timeout for `request_message` and parameter round trips.
    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// The relay's own heartbeat identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_job_running(&self, name: JobName) -> bool {
        self.jobs.is_running(name)
    }

    /// Live background tasks, callbacks in flight included.
    pub fn running_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Close both links, cancel every job and drop pending waiters.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(parent: &self.span, "Stopping relay");
        for slot in [&self.vehicle_link, &self.operator_link] {
            if let Some(link) = write(slot).take() {
                link.close();
            }
        }
        self.jobs.shutdown().await;
        lock(&self.correlation).clear();
        self.callbacks.clear();
        info!(parent: &self.span, "Relay stopped");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn link(&self, role: LinkRole) -> Option<Arc<dyn Link>> {
        let slot = match role {
            LinkRole::Vehicle => &self.vehicle_link,
            LinkRole::Operator => &self.operator_link,
        };
        read(slot).clone()
    }

    fn seen_slot(&self, role: LinkRole) -> &Mutex<Option<Instant>> {
        match role {
            LinkRole::Vehicle => &self.vehicle_seen,
            LinkRole::Operator => &self.operator_seen,
        }
    }

    fn is_live(&self, role: LinkRole) -> bool {
        !self.is_stopped()
            && lock(self.seen_slot(role))
                .is_some_and(|seen| seen.elapsed() < self.config.disconnect_threshold())
    }

    fn require_vehicle(&self) -> Result<Identity, RelayError> {
        if self.is_stopped() {
            return Err(RelayError::Stopped);
        }
        self.vehicle_identity()
            .ok_or(RelayError::NotConnected(LinkRole::Vehicle))
    }

    fn target(&self, component: u8) -> Result<Identity, RelayError> {
        Ok(Identity::new(self.require_vehicle()?.system_id, component))
    }

    /// Commands go out as the operator so acks route back to it; before an
    /// operator is known the relay uses its own identity.
    fn command_identity(&self) -> Identity {
        self.operator_identity().unwrap_or(self.identity)
    }

    fn stamp(&self, source: Identity, message: MavMessage) -> Frame {
        Frame::new(source, message).with_sequence(self.sequence.fetch_add(1, Ordering::Relaxed))
    }

    /// Read everything pending on `source`. Returns how long to back off, or
    /// `None` to go again right away.
    async fn drain(&self, source: LinkRole) -> Option<Duration> {
        let Some(link) = self.link(source) else {
            return Some(self.config.poll_backoff());
        };
        let mut drained = 0usize;
        loop {
            match link.try_recv() {
                Ok(Some(received)) => {
                    drained += 1;
                    self.handle_inbound(source, received).await;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(parent: &self.span, side = %source, error = %e, "Link read failed");
                    return Some(self.config.link_error_backoff());
                }
            }
        }
        (drained == 0).then(|| self.config.poll_backoff())
    }

    async fn handle_inbound(&self, source: LinkRole, received: Received) {
        *lock(self.seen_slot(source)) = Some(Instant::now());

        let frame = match received {
            Received::Frame(frame) => frame,
            Received::Unrecognized { msg_id } => {
                debug!(parent: &self.span, side = %source, msg_id, "Dropping unrecognized message");
                return;
            }
        };
        if self.config.log_messages {
            trace!(parent: &self.span, side = %source, from = %frame.source(), msg_id = frame.message_id(), "Relaying");
        }

        let destination = match source {
            LinkRole::Vehicle => LinkRole::Operator,
            LinkRole::Operator => LinkRole::Vehicle,
        };
        if self.is_live(destination) {
            if let Some(link) = self.link(destination) {
                if let Err(e) = link.send(&frame).await {
                    debug!(parent: &self.span, side = %destination, error = %e, "Forward failed");
                }
            }
        }

        if source == LinkRole::Vehicle {
            self.dispatch_callbacks(&frame);
            self.correlate(&frame);
        }
    }

    fn dispatch_callbacks(&self, frame: &Frame) {
        let msg_id = frame.message_id();
        for handler in self.callbacks.handlers_for(msg_id) {
            let frame = frame.clone();
            self.jobs.spawn(JobName::Callback, async move {
                if let Err(e) = isolate(handler(frame)).await {
                    warn!(msg_id, error = %e, "Message callback failed");
                }
            });
        }
    }

    fn correlate(&self, frame: &Frame) {
        let source = frame.source();
        if let MavMessage::COMMAND_ACK(ack) = &frame.message {
            let key = AckKey {
                command: ack.command as u32,
                vehicle_system: source.system_id,
                target_component: source.component_id,
                operator_system: ack.target_system,
                operator_component: ack.target_component,
            };
            let accepted = ack.result == MavResult::MAV_RESULT_ACCEPTED;
            if lock(&self.correlation).resolve_ack(&key, accepted) {
                debug!(parent: &self.span, command = ?ack.command, result = ?ack.result, "Command acknowledged");
            } else {
                trace!(parent: &self.span, command = ?ack.command, "Ack with no waiter");
            }
        } else {
            let key = MessageKey {
                msg_id: frame.message_id(),
                system: source.system_id,
                component: source.component_id,
            };
            let resolved = lock(&self.correlation).resolve_messages(&key, frame);
            if resolved > 0 {
                trace!(parent: &self.span, msg_id = key.msg_id, resolved, "Message waiters resolved");
            }
        }
    }

    fn next_ping(&self) -> MavMessage {
        let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
        let time_usec = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or_default();
        protocol::ping(seq, time_usec)
    }
}

// ============================================================================
// Job bodies
// ============================================================================

async fn heartbeat_loop(relay: Weak<ProtocolRelay>, side: LinkRole, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(relay) = relay.upgrade() else { return };
        let Some(link) = relay.link(side) else { continue };
        let frame = relay.stamp(relay.identity, protocol::relay_heartbeat());
        if let Err(e) = link.send(&frame).await {
            debug!(side = %side, error = %e, "Heartbeat not sent");
        }
    }
}

async fn ping_loop(relay: Weak<ProtocolRelay>, side: LinkRole, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(relay) = relay.upgrade() else { return };
        let Some(link) = relay.link(side) else { continue };
        let frame = relay.stamp(relay.identity, relay.next_ping());
        if let Err(e) = link.send(&frame).await {
            debug!(side = %side, error = %e, "Ping not sent");
        }
    }
}

async fn relay_loop(relay: Weak<ProtocolRelay>, source: LinkRole) {
    loop {
        let Some(strong) = relay.upgrade() else { return };
        let pause = strong.drain(source).await;
        drop(strong);
        match pause {
            Some(backoff) => tokio::time::sleep(backoff).await,
            None => tokio::task::yield_now().await,
        }
    }
}

/// Wait for the operator's first heartbeat, learn its identity, then start
/// operator pings and operator → vehicle relaying.
async fn operator_handshake(relay: Weak<ProtocolRelay>) {
    loop {
        let Some(strong) = relay.upgrade() else { return };
        let Some(link) = strong.link(LinkRole::Operator) else { return };
        let backoff = strong.config.poll_backoff();

        loop {
            match link.try_recv() {
                Ok(Some(Received::Frame(frame))) => {
                    *lock(&strong.operator_seen) = Some(Instant::now());
                    if let MavMessage::HEARTBEAT(_) = frame.message {
                        let operator = frame.source();
                        lock(&strong.peers).operator = Some(operator);
                        info!(parent: &strong.span, %operator, "✓ Operator connected");

                        let period = strong.config.ping_period();
                        strong.jobs.spawn(
                            JobName::OperatorPing,
                            ping_loop(relay.clone(), LinkRole::Operator, period),
                        );
                        strong
                            .jobs
                            .spawn(JobName::OperatorRelay, relay_loop(relay, LinkRole::Operator));
                        return;
                    }
                }
                Ok(Some(Received::Unrecognized { .. })) => {
                    *lock(&strong.operator_seen) = Some(Instant::now());
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(parent: &strong.span, error = %e, "Operator link read failed");
                    break;
                }
            }
        }
        drop(strong);
        tokio::time::sleep(backoff).await;
    }
}
