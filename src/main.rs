//! dronefleet - fleet control core
//!
//! Relays MAVLink between each vehicle and a ground station, fans commands
//! out across the fleet and keeps manual control inside geofences.
//!
//! # Usage
//!
//! ```bash
//! # Connect the vehicles listed in dronefleet.toml and relay until Ctrl+C
//! dronefleet run
//!
//! # Add vehicles on the command line
//! dronefleet run --vehicle alpha=udp://:14540 --vehicle bravo=udp://:14541
//!
//! # Simulated fleet, no hardware needed
//! dronefleet demo --vehicles 3
//! ```
//!
//! # Environment Variables
//!
//! - `DRONEFLEET_CONFIG`: Path to the fleet config (default: ./dronefleet.toml)
//! - `RUST_LOG`: Logging level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dronefleet::config::{self, FleetConfig};
use dronefleet::link::UdpTransport;
use dronefleet::protocol::{ids, mav::MavAutopilot, LinkAddress};
use dronefleet::sim::{SimulatedVehicle, Simulator};
use dronefleet::{Arg, ConnectRequest, Fence, FleetSupervisor, ManualInput, Waypoint};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "dronefleet")]
#[command(about = "MAVLink fleet relay, fan-out and geofence governor")]
#[command(version)]
struct CliArgs {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Connect real vehicles over UDP and relay until Ctrl+C
    Run {
        /// Extra vehicle as NAME=ADDRESS, e.g. alpha=udp://:14540
        #[arg(long = "vehicle", value_name = "NAME=ADDRESS")]
        vehicles: Vec<String>,

        /// Handshake timeout per vehicle in seconds (default: from config)
        #[arg(long)]
        connect_timeout: Option<u64>,
    },

    /// Fly a simulated fleet through connect, arm, takeoff and goto
    Demo {
        /// Number of simulated vehicles
        #[arg(long, default_value = "3")]
        vehicles: u8,

        /// First simulated dial port; vehicle i uses base + i
        #[arg(long, default_value = "14540")]
        base_port: u16,
    },
}

/// Parse `name=address`.
fn parse_vehicle_arg(arg: &str) -> Result<(String, String)> {
    let (name, address) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=ADDRESS, got '{arg}'"))?;
    if name.is_empty() {
        return Err(anyhow!("vehicle name missing in '{arg}'"));
    }
    address
        .parse::<LinkAddress>()
        .with_context(|| format!("invalid address for '{name}'"))?;
    Ok((name.to_string(), address.to_string()))
}

// ============================================================================
// run
// ============================================================================

async fn run_fleet(
    config: FleetConfig,
    extra: Vec<String>,
    connect_timeout: Option<u64>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut directory = config.vehicles.clone();
    for arg in &extra {
        let (name, address) = parse_vehicle_arg(arg)?;
        directory.insert(name, address);
    }
    if directory.is_empty() {
        warn!("No vehicles configured; add [vehicles] to the config or pass --vehicle");
    }

    let fleet = FleetSupervisor::new(config, Arc::new(UdpTransport));
    for (name, e) in fleet.autoload_capabilities().await {
        error!(capability = %name, error = %e, "Capability not loaded");
    }

    info!("📡 Connecting {} vehicle(s)...", directory.len());
    let connects = directory.into_iter().map(|(name, address)| {
        let mut request = ConnectRequest::new(name.clone(), address).cancel_on(cancel.clone());
        if let Some(secs) = connect_timeout {
            request = request.timeout(Duration::from_secs(secs));
        }
        let fleet = Arc::clone(&fleet);
        async move { (name, fleet.connect(request).await) }
    });
    for (name, result) in join_all(connects).await {
        match result {
            Ok(vehicle) => info!(
                vehicle = %name,
                relay = %vehicle.relay_address(),
                dialect = %vehicle.relay().dialect().map(|d| d.to_string()).unwrap_or_default(),
                "✓ Relaying"
            ),
            Err(e) => error!(vehicle = %name, error = %e, "Connect failed"),
        }
    }
    info!("✓ {} of the fleet connected: {}", fleet.len(), fleet.names().join(", "));

    cancel.cancelled().await;
    fleet.close().await;
    Ok(())
}

// ============================================================================
// demo
// ============================================================================

async fn run_demo(config: FleetConfig, count: u8, base_port: u16) -> Result<()> {
    let (transport, sim) = Simulator::start();
    let mut names = Vec::new();
    for i in 0..count {
        let address = LinkAddress::udp("", base_port.saturating_add(u16::from(i)));
        let autopilot = if i % 2 == 0 {
            MavAutopilot::MAV_AUTOPILOT_PX4
        } else {
            MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA
        };
        sim.add_vehicle(&address, SimulatedVehicle::new(i + 1).with_autopilot(autopilot));
        names.push((format!("sim{}", i + 1), address.to_string()));
    }

    let fleet = FleetSupervisor::new(config, transport);
    info!("🧪 Connecting {} simulated vehicle(s)...", names.len());
    let connects = names.iter().map(|(name, address)| {
        let fleet = Arc::clone(&fleet);
        let request = ConnectRequest::new(name.clone(), address.clone());
        async move { fleet.connect(request).await }
    });
    for result in join_all(connects).await {
        result?;
    }
    let names: Vec<&str> = names.iter().map(|(name, _)| name.as_str()).collect();
    for vehicle in fleet.vehicles() {
        info!(
            vehicle = vehicle.name(),
            dialect = %vehicle.relay().dialect().map(|d| d.to_string()).unwrap_or_default(),
            "✓ Connected"
        );
    }

    let fence = Fence::from_config((-50.0, 50.0), (-50.0, 50.0), (-30.0, 0.0), 2, &fleet.config().fence)?;
    info!("{}", fleet.set_fence(&names, Arg::Shared(Some(fence))).await?);
    info!("{}", fleet.arm(&names).await?);
    info!("{}", fleet.takeoff(&names, Arg::Shared(10.0)).await?);

    let waypoints = (0..names.len())
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let offset = i as f64 * 5.0;
            Waypoint::ned(offset, offset, -10.0)
        })
        .collect();
    info!("{}", fleet.goto(&names, Arg::PerVehicle(waypoints)).await?);

    // Stick input goes through the fence clamp before it is sent.
    let report = fleet
        .manual_control(&names, Arg::Shared(ManualInput::new(1.0, 0.0, 0.0, 0.0)))
        .await?;
    for (name, outcome) in &report.outcomes {
        match outcome {
            Ok(sent) => info!(vehicle = %name, forward = sent.forward, "Manual input sent"),
            Err(e) => warn!(vehicle = %name, error = %format!("{e:#}"), "Manual input failed"),
        }
    }

    if let Some(first) = fleet.vehicles().first() {
        match first.request_message(ids::AUTOPILOT_VERSION, &[]).await {
            Ok(frame) => info!(vehicle = first.name(), message = ?frame.message, "✓ Requested message arrived"),
            Err(e) => warn!(vehicle = first.name(), error = %e, "Message request failed"),
        }
    }

    info!("{}", fleet.land(&names).await?);
    info!("{}", fleet.disarm(&names).await?);

    println!();
    println!("  Demo fleet report");
    println!();
    for vehicle in fleet.vehicles() {
        let telemetry = vehicle.telemetry();
        println!(
            "    {:<8} armed={:<5} position={:?} heading={:?}",
            vehicle.name(),
            telemetry.armed,
            telemetry.position,
            telemetry.heading_deg()
        );
    }
    println!();

    fleet.close().await;
    sim.shutdown().await;
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let fleet_config = FleetConfig::load();
    info!(
        "Relay: {}/{} | Vehicles configured: {} | Autoload: [{}]",
        fleet_config.relay.system_id,
        fleet_config.relay.component_id,
        fleet_config.vehicles.len(),
        fleet_config.capabilities.autoload.join(", ")
    );
    config::init(fleet_config);

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  dronefleet - MAVLink fleet control core");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    match args.command {
        SubCommand::Run {
            vehicles,
            connect_timeout,
        } => run_fleet(config::get().clone(), vehicles, connect_timeout, cancel_token).await?,
        SubCommand::Demo { vehicles, base_port } => {
            tokio::select! {
                () = cancel_token.cancelled() => warn!("Demo interrupted"),
                result = run_demo(config::get().clone(), vehicles, base_port) => result?,
            }
        }
    }

    info!("✓ dronefleet shutdown complete");
    Ok(())
}
