//! UDP datagram transport: JSON envelopes broadcast on a fixed port.
//!
//! One datagram per envelope. The default target is the IPv4 broadcast
//! address on the bound port; tests and single-host setups can retarget to
//! loopback. Port 0 binds an ephemeral socket for send-only operator
//! commands.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::messages::{AgentId, Envelope, Message, PROTOCOL};

/// Operator CLI identity: never heartbeats, so it never joins the fleet view.
pub const OPERATOR_ID: AgentId = AgentId(0);

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug)]
pub struct UdpBus {
    socket: UdpSocket,
    agent: AgentId,
    quarry_id: String,
    seq: u64,
    target: SocketAddr,
    buf: Vec<u8>,
}

impl UdpBus {
    /// Bind an agent endpoint on `port` and target the broadcast address.
    pub async fn bind(agent: AgentId, quarry_id: impl Into<String>, port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            agent,
            quarry_id: quarry_id.into(),
            seq: 0,
            target: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    /// Bind an ephemeral send-only endpoint for operator commands targeting
    /// fleets listening on `port`.
    pub async fn operator(quarry_id: impl Into<String>, port: u16) -> std::io::Result<Self> {
        let mut bus = Self::bind(OPERATOR_ID, quarry_id, 0).await?;
        bus.target = SocketAddr::from((Ipv4Addr::BROADCAST, port));
        Ok(bus)
    }

    /// Redirect datagrams (loopback in tests, unicast relays).
    pub fn set_target(&mut self, target: SocketAddr) {
        self.target = target;
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn send(&mut self, to: Option<AgentId>, message: Message) -> std::io::Result<u64> {
        self.seq += 1;
        let envelope = Envelope {
            protocol: PROTOCOL.to_string(),
            sender: self.agent,
            seq: self.seq,
            timestamp: Utc::now(),
            quarry_id: self.quarry_id.clone(),
            to,
            message,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        trace!(sender = %self.agent, seq = self.seq, bytes = bytes.len(), "UDP send");
        self.socket.send_to(&bytes, self.target).await?;
        Ok(self.seq)
    }

    /// Receive the next envelope addressed to this endpoint, waiting at most
    /// `timeout`. Malformed datagrams are logged and skipped.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await;
            match received {
                Err(_) => return None,
                Ok(Err(e)) => {
                    warn!(error = %e, "UDP receive failed");
                    return None;
                }
                Ok(Ok((len, from))) => {
                    match serde_json::from_slice::<Envelope>(&self.buf[..len]) {
                        Ok(envelope) => {
                            if envelope.addressed_to(self.agent, &self.quarry_id) {
                                return Some(envelope);
                            }
                        }
                        Err(e) => {
                            warn!(from = %from, error = %e, "Dropping malformed datagram");
                        }
                    }
                }
            }
        }
    }
}
