//! Message bus: quarry-scoped broadcast with bounded receive.
//!
//! Two transports share one interface through [`AgentBus`]: the in-process
//! loopback hub used by the fleet runner and tests, and the UDP datagram bus
//! used across processes. Both deliver every envelope to every endpoint and
//! filter on the receive side, which keeps directed messages and quarry
//! scoping in one place ([`Envelope::addressed_to`]).
//!
//! The loopback hub rides on `tokio::sync::broadcast`, which preserves
//! global send order and therefore the sender-FIFO guarantee the tunnel
//! mutex relies on.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::Result;
use crate::messages::{AgentId, Envelope, Message, PROTOCOL};
use crate::udp::UdpBus;

/// Capacity of the loopback channel; a lagging receiver skips old envelopes
/// rather than blocking the fleet.
const LOOPBACK_CAPACITY: usize = 1024;

/// The shared in-process hub. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    tx: broadcast::Sender<Envelope>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOOPBACK_CAPACITY);
        Self { tx }
    }

    /// Mint an endpoint for one agent.
    pub fn endpoint(&self, agent: AgentId, quarry_id: impl Into<String>) -> LoopbackBus {
        LoopbackBus {
            agent,
            quarry_id: quarry_id.into(),
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
            seq: 0,
        }
    }

    /// Forward an externally received envelope (e.g. an operator datagram)
    /// onto the hub unchanged.
    pub fn inject(&self, envelope: Envelope) {
        let _ = self.tx.send(envelope);
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One agent's endpoint on the loopback hub.
#[derive(Debug)]
pub struct LoopbackBus {
    agent: AgentId,
    quarry_id: String,
    tx: broadcast::Sender<Envelope>,
    rx: broadcast::Receiver<Envelope>,
    seq: u64,
}

impl LoopbackBus {
    pub fn send(&mut self, to: Option<AgentId>, message: Message) -> u64 {
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
        trace!(sender = %self.agent, seq = self.seq, kind = envelope.message.label(), "Bus send");
        // A send with no live receivers is not an error for a broadcast bus.
        let _ = self.tx.send(envelope);
        self.seq
    }

    /// Receive the next envelope addressed to this endpoint, waiting at most
    /// `timeout`. A zero timeout drains already-queued messages.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return None,
                Ok(Ok(envelope)) => {
                    if envelope.addressed_to(self.agent, &self.quarry_id) {
                        return Some(envelope);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(agent = %self.agent, skipped = skipped, "Bus receiver lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            }
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// The transport an agent was wired with at start.
#[derive(Debug)]
pub enum AgentBus {
    Loopback(LoopbackBus),
    Udp(UdpBus),
}

impl AgentBus {
    pub async fn send(&mut self, to: Option<AgentId>, message: Message) -> Result<u64> {
        match self {
            AgentBus::Loopback(bus) => Ok(bus.send(to, message)),
            AgentBus::Udp(bus) => Ok(bus.send(to, message).await?),
        }
    }

    pub async fn recv(&mut self, timeout: Duration) -> Option<Envelope> {
        match self {
            AgentBus::Loopback(bus) => bus.recv(timeout).await,
            AgentBus::Udp(bus) => bus.recv(timeout).await,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            AgentBus::Loopback(bus) => bus.seq(),
            AgentBus::Udp(bus) => bus.seq(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(0);

    #[tokio::test]
    async fn broadcast_reaches_all_other_endpoints() {
        let hub = LoopbackHub::new();
        let mut a = hub.endpoint(AgentId(1), "q1");
        let mut b = hub.endpoint(AgentId(2), "q1");
        let mut c = hub.endpoint(AgentId(3), "q1");

        a.send(None, Message::Recall { active: true });

        assert!(b.recv(NO_WAIT).await.is_some());
        assert!(c.recv(NO_WAIT).await.is_some());
        // The sender never hears itself.
        assert!(a.recv(NO_WAIT).await.is_none());
    }

    #[tokio::test]
    async fn directed_send_skips_bystanders() {
        let hub = LoopbackHub::new();
        let mut a = hub.endpoint(AgentId(1), "q1");
        let mut b = hub.endpoint(AgentId(2), "q1");
        let mut c = hub.endpoint(AgentId(3), "q1");

        a.send(Some(AgentId(2)), Message::JobRequest);

        let received = b.recv(NO_WAIT).await.unwrap();
        assert_eq!(received.message, Message::JobRequest);
        assert!(c.recv(NO_WAIT).await.is_none());
    }

    #[tokio::test]
    async fn quarry_scoping_isolates_domains() {
        let hub = LoopbackHub::new();
        let mut a = hub.endpoint(AgentId(1), "q1");
        let mut other = hub.endpoint(AgentId(2), "q2");

        a.send(None, Message::Recall { active: true });
        assert!(other.recv(NO_WAIT).await.is_none());
    }

    #[tokio::test]
    async fn sender_fifo_order_is_preserved() {
        let hub = LoopbackHub::new();
        let mut a = hub.endpoint(AgentId(1), "q1");
        let mut b = hub.endpoint(AgentId(2), "q1");

        for _ in 0..5 {
            a.send(None, Message::HomeAck);
        }
        let mut seqs = Vec::new();
        while let Some(envelope) = b.recv(NO_WAIT).await {
            seqs.push(envelope.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn recv_times_out_when_quiet() {
        let hub = LoopbackHub::new();
        let mut a = hub.endpoint(AgentId(1), "q1");
        let got = a.recv(Duration::from_millis(10)).await;
        assert!(got.is_none());
    }
}
