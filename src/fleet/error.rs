use std::time::Duration;

use thiserror::Error;

use crate::protocol::AddressError;
use crate::relay::RelayError;
use crate::vehicle::VehicleError;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{name}: no autopilot answered within {timeout:?}")]
    ConnectTimeout { name: String, timeout: Duration },

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("a vehicle named '{0}' already exists")]
    DuplicateName(String),

    #[error("{address} is already used by '{existing}'")]
    DuplicateAddress { address: String, existing: String },

    #[error("no free local port for the relay: {0}")]
    NoRelayPort(std::io::Error),

    #[error("connecting '{0}' was cancelled")]
    CancelledConnect(String),

    #[error("{name}: connect failed")]
    ConnectFailed {
        name: String,
        #[source]
        cause: VehicleError,
    },

    #[error("{name}: connect hook failed: {reason:#}")]
    HookFailed { name: String, reason: anyhow::Error },

    #[error("no vehicle named '{0}'")]
    UnknownVehicle(String),

    #[error(transparent)]
    Vehicle(#[from] VehicleError),
}

impl FleetError {
    /// Map a failed vehicle connect onto the fleet's classification.
    pub(crate) fn from_connect(name: &str, error: VehicleError) -> Self {
        match error {
            VehicleError::Relay(RelayError::ConnectTimeout { timeout, .. }) => Self::ConnectTimeout {
                name: name.to_string(),
                timeout,
            },
            VehicleError::Relay(RelayError::Address(e)) => Self::Address(e),
            VehicleError::Relay(RelayError::Cancelled(_) | RelayError::Stopped) => {
                Self::CancelledConnect(name.to_string())
            }
            cause => Self::ConnectFailed {
                name: name.to_string(),
                cause,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown vehicles: {}", .0.join(", "))]
    UnknownVehicles(Vec<String>),

    #[error("{got} arguments given for {expected} vehicles")]
    ArgumentMismatch { expected: usize, got: usize },
}
