use std::time::Duration;

use thiserror::Error;

use crate::link::{LinkError, LinkRole};
use crate::protocol::params::ParamError;
use crate::protocol::AddressError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no autopilot heartbeat on {address} within {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("link failure: {0}")]
    Link(#[from] LinkError),

    #[error("connect to {0} was cancelled")]
    Cancelled(String),

    #[error("timed out after {timeout:?} waiting for {what}")]
    RequestTimeout { what: String, timeout: Duration },

    #[error("{what}: acknowledged but the response never arrived")]
    CorrelationMismatch { what: String },

    #[error("COMMAND_LONG carries at most 7 parameters, got {0}")]
    TooManyParams(usize),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error("not connected to the {0}")]
    NotConnected(LinkRole),

    #[error("relay stopped")]
    Stopped,
}

impl RelayError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectTimeout { .. } | RelayError::RequestTimeout { .. }
        )
    }
}
