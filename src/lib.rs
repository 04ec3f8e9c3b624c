//! dronefleet: fleet control core for MAVLink vehicles
//!
//! ## Architecture
//!
//! - **Protocol Relay** (`relay`): one per vehicle, bridges the autopilot and
//!   the operator's ground station, correlates acks and requested messages,
//!   keeps both sides alive with heartbeats and pings
//! - **Fleet Supervisor** (`fleet`): named registry of vehicles, connect and
//!   disconnect lifecycle, concurrent fan-out of actions, capability loading
//! - **Safety Governor** (`governor`): geofence waypoint gate and manual
//!   input clamp
//!
//! Links (`link`) are pluggable: UDP for real vehicles, in-process channels
//! for tests and the simulator (`sim`).

pub mod background;
pub mod capability;
pub mod config;
pub mod fleet;
pub mod governor;
pub mod link;
pub mod protocol;
pub mod relay;
pub mod sim;
pub mod vehicle;

mod sync;

// Re-export configuration
pub use config::{FleetConfig, RelayConfig, VehicleConfig};

// Re-export the fleet surface
pub use fleet::{
    Arg, ConnectRequest, DispatchError, DispatchMode, DispatchReport, FleetError, FleetSupervisor,
};
pub use vehicle::{LinkState, Vehicle, VehicleError};

// Re-export governor types
pub use governor::{Fence, FenceError, ManualInput, SpeedLimits, VehiclePose, Waypoint, WaypointFrame};

// Re-export relay components
pub use relay::{ProtocolRelay, RelayError};
pub use protocol::{Dialect, Frame, Identity, LinkAddress};

// Re-export capability components
pub use capability::{Capability, CapabilityCatalogue, CapabilityContext, CapabilityError};
