//! In-process links.
//!
//! Every `open` creates a channel pair: the caller gets one end and the
//! other end is handed to whoever holds the matching [`MemoryPeers`], e.g. a
//! simulated vehicle. Dropping either end makes the other report
//! [`LinkError::Closed`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::{Link, LinkError, LinkFactory, LinkRole, Received};
use crate::protocol::{Frame, LinkAddress};
use crate::sync::lock;

pub struct MemoryLink {
    tx: mpsc::UnboundedSender<Received>,
    rx: Mutex<mpsc::UnboundedReceiver<Received>>,
    closed: AtomicBool,
    label: String,
}

impl MemoryLink {
    /// Two connected ends.
    pub fn pair(label: &str) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self::new(a_tx, b_rx, format!("mem://{label}#a")),
            Self::new(b_tx, a_rx, format!("mem://{label}#b")),
        )
    }

    fn new(
        tx: mpsc::UnboundedSender<Received>,
        rx: mpsc::UnboundedReceiver<Received>,
        label: String,
    ) -> Self {
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            label,
        }
    }

    /// Deliver an arbitrary read result to the other end, including
    /// packets the codec would not recognize.
    pub fn inject(&self, received: Received) -> Result<(), LinkError> {
        self.tx.send(received).map_err(|_| LinkError::Closed)
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: &Frame) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.inject(Received::Frame(frame.clone()))
    }

    fn try_recv(&self) -> Result<Option<Received>, LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        match lock(&self.rx).try_recv() {
            Ok(received) => Ok(Some(received)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(LinkError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.rx).close();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// The far end of one `open` call.
pub struct MemoryEndpoint {
    pub address: LinkAddress,
    pub role: LinkRole,
    pub link: MemoryLink,
}

/// Link factory whose peers live in the same process.
pub struct MemoryTransport {
    endpoints: mpsc::UnboundedSender<MemoryEndpoint>,
    refused: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryPeers) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                endpoints: tx,
                refused: Mutex::new(HashSet::new()),
            },
            MemoryPeers { rx },
        )
    }

    /// Make every later `open` of this address fail like an unusable port.
    pub fn refuse(&self, address: &LinkAddress) {
        lock(&self.refused).insert(address.location_key());
    }
}

#[async_trait]
impl LinkFactory for MemoryTransport {
    async fn open(&self, address: &LinkAddress, role: LinkRole) -> Result<Arc<dyn Link>, LinkError> {
        if lock(&self.refused).contains(&address.location_key()) {
            return Err(LinkError::Address {
                address: address.to_string(),
                reason: "address refused".to_string(),
            });
        }
        let (ours, theirs) = MemoryLink::pair(&format!("{role}@{address}"));
        self.endpoints
            .send(MemoryEndpoint {
                address: address.clone(),
                role,
                link: theirs,
            })
            .map_err(|_| LinkError::Address {
                address: address.to_string(),
                reason: "no peer is accepting".to_string(),
            })?;
        Ok(Arc::new(ours))
    }
}

/// Receives the far ends of links opened through a [`MemoryTransport`].
pub struct MemoryPeers {
    rx: mpsc::UnboundedReceiver<MemoryEndpoint>,
}

impl MemoryPeers {
    pub async fn accept(&mut self) -> Option<MemoryEndpoint> {
        self.rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryEndpoint> {
        self.rx.try_recv().ok()
    }
}
