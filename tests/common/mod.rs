//! Shared helpers for the integration tests: fast relay pacing, simulated
//! fleets and polling.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dronefleet::config::{FleetConfig, RelayConfig, VehicleConfig};
use dronefleet::protocol::LinkAddress;
use dronefleet::sim::{SimulatedVehicle, Simulator};
use dronefleet::{ConnectRequest, FleetSupervisor};

/// Relay and vehicle settings tuned for tests: quick probes, short
/// command timeouts.
pub fn test_config() -> FleetConfig {
    FleetConfig {
        relay: RelayConfig {
            heartbeat_period_ms: 50,
            probe_period_ms: 20,
            disconnect_threshold_ms: 1_000,
            request_timeout_secs: 2,
            ..RelayConfig::default()
        },
        vehicle: VehicleConfig {
            connect_timeout_secs: 3,
            command_timeout_secs: 2,
            ..VehicleConfig::default()
        },
        ..FleetConfig::default()
    }
}

/// Dial address of the `index`-th simulated vehicle.
pub fn sim_address(index: u16) -> LinkAddress {
    LinkAddress::udp("", 14_540 + index)
}

/// A supervisor over memory links with `vehicles` registered in the
/// simulator at `sim_address(i)`, not yet connected.
pub fn sim_fleet(vehicles: &[SimulatedVehicle]) -> (Arc<FleetSupervisor>, Arc<Simulator>) {
    let (transport, sim) = Simulator::start();
    for (i, vehicle) in vehicles.iter().enumerate() {
        sim.add_vehicle(&sim_address(index(i)), vehicle.clone());
    }
    (FleetSupervisor::new(test_config(), transport), sim)
}

/// Connect every simulated vehicle of [`sim_fleet`], panicking on failure.
pub async fn connect_all(fleet: &FleetSupervisor, count: usize) -> Vec<String> {
    let mut names = Vec::new();
    for i in 0..count {
        let name = format!("v{i}");
        fleet
            .connect(ConnectRequest::new(name.clone(), sim_address(index(i)).to_string()))
            .await
            .unwrap_or_else(|e| panic!("connect {name}: {e}"));
        names.push(name);
    }
    names
}

pub fn as_strs(names: &[String]) -> Vec<&str> {
    names.iter().map(String::as_str).collect()
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn index(i: usize) -> u16 {
    u16::try_from(i).unwrap()
}
