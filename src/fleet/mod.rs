//! Fleet Supervisor
//!
//! One per process. Keeps the name → [`Vehicle`] registry, drives the
//! connect/disconnect lifecycle, fans actions out across vehicles and
//! loads capabilities.
//!
//! ## Invariants
//!
//! - vehicle names are unique, and so are dial locations
//! - the registry is only mutated under one async lock; readers take a
//!   short read lock on the map
//! - a failed, timed-out or cancelled connect leaves nothing registered,
//!   running or bound
//! - one vehicle's failure in a fan-out never affects its siblings

mod capabilities;
mod dispatch;
mod error;
mod hooks;

pub use capabilities::RESERVED_NAMES;
pub use dispatch::{Arg, DispatchMode, DispatchReport, FanOut};
pub use error::{DispatchError, FleetError};
pub use hooks::{CapabilityHook, RemovalHook, VehicleHook};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{Capability, CapabilityCatalogue};
use crate::config::FleetConfig;
use crate::governor::{Fence, ManualInput, Waypoint};
use crate::link::LinkFactory;
use crate::protocol::LinkAddress;
use crate::sync::{lock, read, write};
use crate::vehicle::Vehicle;

use capabilities::LoadedCapability;
use hooks::Hooks;

/// Host the relay's operator side sends to when no address is given.
const LOCAL_RELAY_HOST: &str = "127.0.0.1";

/// What to connect and how.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub name: String,
    /// Where the autopilot talks, e.g. `udp://:14540`
    pub address: String,
    /// Where the relay forwards to; a free local port when absent
    pub relay_address: Option<String>,
    /// Handshake timeout; the configured default when absent
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ConnectRequest {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            relay_address: None,
            timeout: None,
            cancel: None,
        }
    }

    #[must_use]
    pub fn relay_address(mut self, address: impl Into<String>) -> Self {
        self.relay_address = Some(address.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub struct FleetSupervisor {
    me: Weak<FleetSupervisor>,
    config: FleetConfig,
    transport: Arc<dyn LinkFactory>,
    vehicles: RwLock<BTreeMap<String, Arc<Vehicle>>>,
    /// Structural lock, held while the vehicle map is mutated.
    registry: tokio::sync::Mutex<()>,
    /// Names and locations of connects in flight.
    reservations: Arc<Mutex<BTreeMap<String, String>>>,
    hooks: Hooks,
    catalogue: CapabilityCatalogue,
    capabilities: RwLock<Vec<LoadedCapability>>,
    capability_lock: tokio::sync::Mutex<()>,
}

impl FleetSupervisor {
    /// Supervisor with the bundled capabilities.
    pub fn new(config: FleetConfig, transport: Arc<dyn LinkFactory>) -> Arc<Self> {
        Self::with_catalogue(config, transport, CapabilityCatalogue::builtin())
    }

    pub fn with_catalogue(
        config: FleetConfig,
        transport: Arc<dyn LinkFactory>,
        catalogue: CapabilityCatalogue,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            transport,
            vehicles: RwLock::new(BTreeMap::new()),
            registry: tokio::sync::Mutex::new(()),
            reservations: Arc::new(Mutex::new(BTreeMap::new())),
            hooks: Hooks::default(),
            catalogue,
            capabilities: RwLock::new(Vec::new()),
            capability_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub fn vehicle(&self, name: &str) -> Option<Arc<Vehicle>> {
        read(&self.vehicles).get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        read(&self.vehicles).keys().cloned().collect()
    }

    pub fn vehicles(&self) -> Vec<Arc<Vehicle>> {
        read(&self.vehicles).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.vehicles).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.vehicles).is_empty()
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    /// Connect a vehicle and register it under `request.name`.
    ///
    /// Names and dial locations are reserved up front, so two concurrent
    /// connects for the same name or location cannot both proceed. Any
    /// failure tears the vehicle down completely before returning.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Arc<Vehicle>, FleetError> {
        let ConnectRequest {
            name,
            address,
            relay_address,
            timeout,
            cancel,
        } = request;
        let address: LinkAddress = address.parse()?;
        let relay_address = match relay_address {
            Some(relay) => relay.parse()?,
            None => free_relay_address().map_err(FleetError::NoRelayPort)?,
        };
        let timeout = timeout.unwrap_or_else(|| self.config.vehicle.connect_timeout());
        let cancel = cancel.unwrap_or_default();

        let reservation = self.reserve(&name, &address).await?;
        info!(vehicle = %name, %address, relay = %relay_address, "Connecting vehicle");

        let vehicle = Vehicle::new(
            &name,
            address,
            relay_address,
            self.config.relay.clone(),
            self.config.vehicle.clone(),
            Arc::clone(&self.transport),
        );
        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(FleetError::CancelledConnect(name.clone())),
            result = vehicle.connect(timeout) => result.map_err(|e| FleetError::from_connect(&name, e)),
        };

        if let Err(e) = outcome {
            vehicle.shutdown().await;
            drop(reservation);
            warn!(vehicle = %name, error = %e, "Connect failed");
            return Err(e);
        }
        {
            let _registry = self.registry.lock().await;
            write(&self.vehicles).insert(name.clone(), Arc::clone(&vehicle));
            drop(reservation);
        }

        if let Err(reason) = self.hooks.vehicle_connected(&name, &vehicle).await {
            warn!(vehicle = %name, error = %format!("{reason:#}"), "Connect hook failed, disconnecting");
            {
                let _registry = self.registry.lock().await;
                write(&self.vehicles).remove(&name);
            }
            vehicle.shutdown().await;
            return Err(FleetError::HookFailed { name, reason });
        }

        info!(vehicle = %name, "✓ Vehicle connected");
        Ok(vehicle)
    }

    async fn reserve(&self, name: &str, address: &LinkAddress) -> Result<Reservation, FleetError> {
        let location = address.location_key();
        let _registry = self.registry.lock().await;
        let vehicles = read(&self.vehicles);
        let mut pending = lock(&self.reservations);

        if vehicles.contains_key(name) || pending.contains_key(name) {
            return Err(FleetError::DuplicateName(name.to_string()));
        }
        let existing = vehicles
            .values()
            .find(|v| v.address().location_key() == location)
            .map(|v| v.name().to_string())
            .or_else(|| {
                pending
                    .iter()
                    .find(|(_, l)| **l == location)
                    .map(|(n, _)| n.clone())
            });
        if let Some(existing) = existing {
            return Err(FleetError::DuplicateAddress {
                address: address.to_string(),
                existing,
            });
        }
        pending.insert(name.to_string(), location);
        Ok(Reservation {
            table: Arc::clone(&self.reservations),
            name: name.to_string(),
        })
    }

    /// Disconnect `names`, each independently. Unknown names are skipped
    /// with a warning. Armed vehicles are refused unless `force`.
    pub async fn disconnect(&self, names: &[&str], force: bool) -> DispatchReport {
        let targets: Vec<Arc<Vehicle>> = names
            .iter()
            .filter_map(|name| {
                let vehicle = self.vehicle(name);
                if vehicle.is_none() {
                    warn!(vehicle = %name, "Disconnect: no such vehicle");
                }
                vehicle
            })
            .collect();

        let results = join_all(targets.iter().map(|v| v.disconnect(force))).await;

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut removed = Vec::new();
        {
            let _registry = self.registry.lock().await;
            let mut vehicles = write(&self.vehicles);
            for (vehicle, result) in targets.iter().zip(results) {
                let name = vehicle.name().to_string();
                match result {
                    Ok(()) => {
                        vehicles.remove(&name);
                        removed.push(name.clone());
                        outcomes.push((name, Ok(())));
                    }
                    Err(e) => {
                        warn!(vehicle = %name, error = %e, "Disconnect failed");
                        outcomes.push((name, Err(e.into())));
                    }
                }
            }
        }
        for name in &removed {
            info!(vehicle = %name, "Vehicle disconnected");
            self.hooks.vehicle_removed(name).await;
        }
        DispatchReport {
            action: "disconnect".to_string(),
            outcomes,
        }
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    /// Run `action` on every named vehicle concurrently.
    ///
    /// Unknown names, or a per-vehicle argument list whose length differs
    /// from the number of vehicles, fail the call before any action runs.
    /// Otherwise every vehicle's outcome is collected, failures and panics
    /// included, and each failure is logged.
    pub async fn dispatch<A, F, Fut, T>(
        &self,
        label: &str,
        names: &[&str],
        mode: DispatchMode,
        args: A,
        action: F,
    ) -> Result<DispatchReport<T>, DispatchError>
    where
        A: FanOut,
        F: Fn(Arc<Vehicle>, A::Item) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let vehicles = self.resolve(names)?;
        if let Some(got) = args.mismatch(vehicles.len()) {
            warn!(action = label, expected = vehicles.len(), got, "Dispatch argument count mismatch");
            return Err(DispatchError::ArgumentMismatch {
                expected: vehicles.len(),
                got,
            });
        }
        debug!(action = label, vehicles = vehicles.len(), ?mode, "Dispatching");

        let items = args.split(vehicles.len());
        let runs = vehicles.iter().zip(items).map(|(vehicle, item)| {
            let operation = action(Arc::clone(vehicle), item);
            let vehicle = Arc::clone(vehicle);
            async move {
                match mode {
                    DispatchMode::Execute => vehicle.execute(operation).await,
                    DispatchMode::Schedule => vehicle.schedule(operation).await,
                }
            }
        });
        let results = join_all(runs).await;

        let outcomes: Vec<(String, anyhow::Result<T>)> = vehicles
            .iter()
            .map(|v| v.name().to_string())
            .zip(results)
            .collect();
        for (name, result) in &outcomes {
            if let Err(e) = result {
                warn!(action = label, vehicle = %name, error = %format!("{e:#}"), "Action failed");
            }
        }
        Ok(DispatchReport {
            action: label.to_string(),
            outcomes,
        })
    }

    fn resolve(&self, names: &[&str]) -> Result<Vec<Arc<Vehicle>>, DispatchError> {
        let registry = read(&self.vehicles);
        let mut found = Vec::with_capacity(names.len());
        let mut unknown = Vec::new();
        for name in names {
            match registry.get(*name) {
                Some(vehicle) => found.push(Arc::clone(vehicle)),
                None => unknown.push((*name).to_string()),
            }
        }
        if unknown.is_empty() {
            Ok(found)
        } else {
            warn!(unknown = ?unknown, "Dispatch to unknown vehicles");
            Err(DispatchError::UnknownVehicles(unknown))
        }
    }

    // ========================================================================
    // Fleet operations
    // ========================================================================

    pub async fn arm(&self, names: &[&str]) -> Result<DispatchReport, DispatchError> {
        self.dispatch("arm", names, DispatchMode::Execute, (), |v, ()| async move {
            Ok(v.arm().await?)
        })
        .await
    }

    pub async fn disarm(&self, names: &[&str]) -> Result<DispatchReport, DispatchError> {
        self.dispatch("disarm", names, DispatchMode::Execute, (), |v, ()| async move {
            Ok(v.disarm().await?)
        })
        .await
    }

    pub async fn takeoff(&self, names: &[&str], altitude: Arg<f32>) -> Result<DispatchReport, DispatchError> {
        self.dispatch("takeoff", names, DispatchMode::Execute, altitude, |v, alt| async move {
            Ok(v.takeoff(alt).await?)
        })
        .await
    }

    pub async fn land(&self, names: &[&str]) -> Result<DispatchReport, DispatchError> {
        self.dispatch("land", names, DispatchMode::Execute, (), |v, ()| async move {
            Ok(v.land().await?)
        })
        .await
    }

    /// Fly to waypoints, queued behind earlier scheduled actions.
    pub async fn goto(&self, names: &[&str], waypoints: Arg<Waypoint>) -> Result<DispatchReport, DispatchError> {
        self.dispatch("goto", names, DispatchMode::Schedule, waypoints, |v, wp| async move {
            Ok(v.goto(&wp).await?)
        })
        .await
    }

    pub async fn set_fence(&self, names: &[&str], fence: Arg<Option<Fence>>) -> Result<DispatchReport, DispatchError> {
        self.dispatch("set_fence", names, DispatchMode::Execute, fence, |v, fence| async move {
            v.set_fence(fence);
            Ok(())
        })
        .await
    }

    /// Send manual input through each vehicle's fence. Reports what was
    /// actually sent.
    pub async fn manual_control(
        &self,
        names: &[&str],
        input: Arg<ManualInput>,
    ) -> Result<DispatchReport<ManualInput>, DispatchError> {
        self.dispatch("manual_control", names, DispatchMode::Execute, input, |v, input| async move {
            Ok(v.manual_control(input).await?)
        })
        .await
    }

    /// Emergency stop: clear each vehicle's queue, abort its running action
    /// and land it if armed. An empty selection stops the whole fleet.
    pub async fn action_stop(&self, names: &[&str]) -> Result<DispatchReport, DispatchError> {
        let everyone = self.names();
        let names = or_everyone(names, &everyone);
        warn!(vehicles = ?names, "🛑 Stopping");
        self.dispatch("action_stop", &names, DispatchMode::Execute, (), |v, ()| async move {
            Ok(v.stop().await?)
        })
        .await
    }

    /// Flight termination. An empty selection kills the whole fleet.
    pub async fn kill(&self, names: &[&str]) -> Result<DispatchReport, DispatchError> {
        let everyone = self.names();
        let names = or_everyone(names, &everyone);
        warn!(vehicles = ?names, "🛑 Killing");
        self.dispatch("kill", &names, DispatchMode::Execute, (), |v, ()| async move {
            Ok(v.kill().await?)
        })
        .await
    }

    /// Hold back each vehicle's scheduled actions.
    pub async fn pause(&self, names: &[&str]) -> Result<DispatchReport, DispatchError> {
        self.dispatch("pause", names, DispatchMode::Execute, (), |v, ()| async move {
            Ok(v.pause()?)
        })
        .await
    }

    pub async fn resume(&self, names: &[&str]) -> Result<DispatchReport, DispatchError> {
        self.dispatch("resume", names, DispatchMode::Execute, (), |v, ()| async move {
            Ok(v.resume()?)
        })
        .await
    }

    /// Queue a delay behind earlier scheduled actions.
    pub async fn wait(&self, names: &[&str], delay: Arg<Duration>) -> Result<DispatchReport, DispatchError> {
        self.dispatch("wait", names, DispatchMode::Schedule, delay, |_, delay| async move {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Unload every capability and force-disconnect every vehicle.
    pub async fn close(&self) {
        info!("Closing fleet");
        self.unload_all_capabilities().await;
        let owned = self.names();
        let names: Vec<&str> = owned.iter().map(String::as_str).collect();
        let report = self.disconnect(&names, true).await;
        info!(%report, "Fleet closed");
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Runs after a vehicle connects. A failing hook disconnects the vehicle
    /// again and fails the connect.
    pub fn on_vehicle_connected<F, Fut>(&self, hook: F)
    where
        F: Fn(String, Arc<Vehicle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.add_vehicle_connected(hook);
    }

    pub fn on_vehicle_removed<F, Fut>(&self, hook: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.add_vehicle_removed(hook);
    }

    pub fn on_capability_loaded<F, Fut>(&self, hook: F)
    where
        F: Fn(String, Arc<dyn Capability>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.add_capability_loaded(hook);
    }

    pub fn on_capability_unloaded<F, Fut>(&self, hook: F)
    where
        F: Fn(String, Arc<dyn Capability>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.add_capability_unloaded(hook);
    }
}

/// Holds a name and location for a connect in flight. Released on drop,
/// also when the connect future itself is dropped.
struct Reservation {
    table: Arc<Mutex<BTreeMap<String, String>>>,
    name: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.name);
    }
}

/// A local UDP address nobody is bound to right now.
fn free_relay_address() -> std::io::Result<LinkAddress> {
    let socket = std::net::UdpSocket::bind((LOCAL_RELAY_HOST, 0))?;
    let port = socket.local_addr()?.port();
    Ok(LinkAddress::udp(LOCAL_RELAY_HOST, port))
}

/// `names`, or every registered name when the selection is empty.
fn or_everyone<'a>(names: &[&'a str], everyone: &'a [String]) -> Vec<&'a str> {
    if names.is_empty() {
        everyone.iter().map(String::as_str).collect()
    } else {
        names.to_vec()
    }
}
