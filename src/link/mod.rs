//! Message links between the relay and its peers.
//!
//! A [`Link`] moves whole [`Frame`]s. Reads never block: the relay polls
//! with `try_recv` and backs off briefly when nothing is pending, so one
//! carrier thread can serve many vehicles.
//!
//! A [`LinkFactory`] opens links from a [`LinkAddress`]. Two are bundled:
//! - [`UdpTransport`]: tokio UDP sockets carrying MAVLink v2 packets
//! - [`MemoryTransport`]: in-process channel pairs for tests and the demo

pub mod memory;
pub mod udp;

pub use memory::{MemoryEndpoint, MemoryLink, MemoryPeers, MemoryTransport};
pub use udp::{UdpLink, UdpTransport};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Frame, LinkAddress};

/// Which end of the conversation a link serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Faces the vehicle: listens on the dial address and learns the peer
    Vehicle,
    /// Faces the operator: sends to the relay address
    Operator,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Vehicle => write!(f, "vehicle"),
            LinkRole::Operator => write!(f, "operator"),
        }
    }
}

/// Result of one non-blocking read.
#[derive(Debug, Clone)]
pub enum Received {
    Frame(Frame),
    /// A well-formed packet whose message id the codec does not know
    Unrecognized { msg_id: u32 },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot open {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("{0} links are not supported by this transport")]
    Unsupported(String),

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("link closed")]
    Closed,
}

/// A bidirectional, frame-oriented link.
#[async_trait]
pub trait Link: Send + Sync {
    /// Send one frame with the header it already carries.
    async fn send(&self, frame: &Frame) -> Result<(), LinkError>;

    /// Next pending frame, or `None` when nothing is available right now.
    fn try_recv(&self) -> Result<Option<Received>, LinkError>;

    /// Stop sending and receiving. Idempotent.
    fn close(&self);

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

/// Opens links by address.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open(&self, address: &LinkAddress, role: LinkRole) -> Result<Arc<dyn Link>, LinkError>;
}
