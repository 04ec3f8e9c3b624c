//! Safety Governor
//!
//! Stateless geofence checks applied before any motion command reaches a
//! vehicle:
//!
//! - [`Fence::waypoint_admissible`] gates discrete waypoints
//! - [`Fence::clamp_manual_input`] caps continuous stick input so one
//!   control period of flight cannot cross the margin-reduced fence
//!
//! Neither keeps state between calls.

mod fence;
mod manual;
mod waypoint;

pub use fence::{Bounds, Fence, FenceError};
pub use manual::{ManualInput, SpeedLimits, VehiclePose};
pub use waypoint::{Waypoint, WaypointFrame};
