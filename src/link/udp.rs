//! UDP links carrying MAVLink v2 packets.
//!
//! Vehicle-facing links bind the dial address and reply to whoever sent
//! the most recent datagram (autopilots and simulators talk first).
//! Operator-facing links bind an ephemeral port and send to the relay
//! address.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mavlink::error::{MessageReadError, ParserError};
use mavlink::peek_reader::PeekReader;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{Link, LinkError, LinkFactory, LinkRole, Received};
use crate::protocol::mav::MavMessage;
use crate::protocol::{Frame, LinkAddress};
use crate::sync::lock;

/// Largest datagram read in one call. MAVLink v2 packets are at most 280
/// bytes; senders may batch several.
const RECV_BUFFER_LEN: usize = 4096;

/// Opens UDP links. Serial addresses are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

#[async_trait]
impl LinkFactory for UdpTransport {
    async fn open(&self, address: &LinkAddress, role: LinkRole) -> Result<Arc<dyn Link>, LinkError> {
        match address {
            LinkAddress::Serial { .. } => Err(LinkError::Unsupported("serial".to_string())),
            LinkAddress::Udp { host, port } => {
                let link = match role {
                    LinkRole::Vehicle => UdpLink::listen(host, *port).await?,
                    LinkRole::Operator => UdpLink::connect(host, *port).await?,
                };
                debug!(link = %link.describe(), role = %role, "UDP link opened");
                Ok(Arc::new(link))
            }
        }
    }
}

pub struct UdpLink {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    learn_peer: bool,
    pending: Mutex<VecDeque<Received>>,
    closed: AtomicBool,
    label: String,
}

impl UdpLink {
    /// Bind `host:port` (all interfaces when `host` is empty) and learn the
    /// peer from incoming datagrams.
    pub async fn listen(host: &str, port: u16) -> Result<Self, LinkError> {
        let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
        let socket = UdpSocket::bind((bind_host, port))
            .await
            .map_err(|e| LinkError::Address {
                address: format!("udp://{host}:{port}"),
                reason: e.to_string(),
            })?;
        Ok(Self::new(socket, None, true, format!("udp-listen://{bind_host}:{port}")))
    }

    /// Bind an ephemeral port and send to `host:port` (loopback when `host`
    /// is empty).
    pub async fn connect(host: &str, port: u16) -> Result<Self, LinkError> {
        let target_host = if host.is_empty() { "127.0.0.1" } else { host };
        let address = format!("udp://{host}:{port}");
        let peer = tokio::net::lookup_host((target_host, port))
            .await
            .map_err(|e| LinkError::Address {
                address: address.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| LinkError::Address {
                address: address.clone(),
                reason: "host did not resolve".to_string(),
            })?;
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self::new(socket, Some(peer), false, format!("udp-send://{peer}")))
    }

    fn new(socket: UdpSocket, peer: Option<SocketAddr>, learn_peer: bool, label: String) -> Self {
        Self {
            socket,
            peer: Mutex::new(peer),
            learn_peer,
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            label,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *lock(&self.peer)
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn send(&self, frame: &Frame) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let Some(peer) = self.peer() else {
            trace!(link = %self.label, "No peer yet, dropping outgoing frame");
            return Ok(());
        };
        let bytes = frame
            .encode()
            .map_err(|e| LinkError::Encode(format!("{e:?}")))?;
        self.socket.send_to(&bytes, peer).await?;
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<Received>, LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let mut pending = lock(&self.pending);
        if let Some(received) = pending.pop_front() {
            return Ok(Some(received));
        }

        let mut buf = [0u8; RECV_BUFFER_LEN];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    if self.learn_peer {
                        *lock(&self.peer) = Some(from);
                    }
                    decode_datagram(&buf[..n], &mut pending);
                    if !pending.is_empty() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(pending.pop_front())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Decode every packet in one datagram. Corrupt bytes are skipped by the
/// codec's resync; packets with unknown ids are reported, not decoded.
fn decode_datagram(bytes: &[u8], out: &mut VecDeque<Received>) {
    let mut reader = PeekReader::new(bytes);
    loop {
        match mavlink::read_v2_msg::<MavMessage, _>(&mut reader) {
            Ok((header, message)) => out.push_back(Received::Frame(Frame { header, message })),
            Err(MessageReadError::Parse(ParserError::UnknownMessage { id })) => {
                out.push_back(Received::Unrecognized { msg_id: id });
            }
            Err(MessageReadError::Parse(e)) => {
                trace!(error = %e, "Skipping undecodable packet");
            }
            Err(MessageReadError::Io(_)) => break,
        }
    }
}
