//! Heartbeat-driven membership and leader election.
//!
//! A peer is live while its last heartbeat is within `timeout_ticks` of the
//! observer's own tick counter. Liveness is deliberately counted in local
//! ticks rather than wall-clock: ticks only advance while the loop runs, so
//! a paused server pauses the clock for everyone and nobody is falsely
//! expired.
//!
//! Election is stateless: the leader is the live agent with the numerically
//! smallest id, recomputed on every view change. No terms, no votes; the
//! rule is deterministic over a consistent view, and brief disagreement is
//! tolerated because tunnel claims reconcile at release time.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::messages::{AgentId, AgentStatus};
use crate::store::PeerSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub last_seen_tick: u64,
    pub status: AgentStatus,
    pub job: Option<String>,
    pub fuel: u64,
    pub config_version: u64,
    /// The peer's own tick counter as of its last heartbeat.
    pub remote_tick: u64,
}

#[derive(Debug)]
pub struct Membership {
    self_id: AgentId,
    timeout_ticks: u64,
    peers: BTreeMap<AgentId, PeerRecord>,
    last_leader: Option<AgentId>,
}

impl Membership {
    pub fn new(self_id: AgentId, timeout_ticks: u64) -> Self {
        Self {
            self_id,
            timeout_ticks,
            peers: BTreeMap::new(),
            last_leader: None,
        }
    }

    pub fn set_timeout(&mut self, timeout_ticks: u64) {
        self.timeout_ticks = timeout_ticks;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn observe_heartbeat(
        &mut self,
        sender: AgentId,
        status: AgentStatus,
        job: Option<String>,
        fuel: u64,
        config_version: u64,
        remote_tick: u64,
        now_tick: u64,
    ) {
        let newcomer = !self.peers.contains_key(&sender);
        self.peers.insert(
            sender,
            PeerRecord {
                last_seen_tick: now_tick,
                status,
                job,
                fuel,
                config_version,
                remote_tick,
            },
        );
        if newcomer {
            info!(peer = %sender, "Peer joined the fleet view");
        }
    }

    pub fn peer(&self, id: AgentId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn is_live(&self, id: AgentId, now_tick: u64) -> bool {
        if id == self.self_id {
            return true;
        }
        self.peers
            .get(&id)
            .map(|p| now_tick.saturating_sub(p.last_seen_tick) <= self.timeout_ticks)
            .unwrap_or(false)
    }

    /// All live agents including self.
    pub fn live_set(&self, now_tick: u64) -> BTreeSet<AgentId> {
        let mut live: BTreeSet<AgentId> = self
            .peers
            .keys()
            .copied()
            .filter(|&id| self.is_live(id, now_tick))
            .collect();
        live.insert(self.self_id);
        live
    }

    /// Lowest live id, including self. With no live peers an agent elects
    /// itself.
    pub fn leader(&mut self, now_tick: u64) -> AgentId {
        let leader = self
            .live_set(now_tick)
            .into_iter()
            .next()
            .expect("live set always contains self");
        if self.last_leader != Some(leader) {
            debug!(leader = %leader, "Leader view changed");
            self.last_leader = Some(leader);
        }
        leader
    }

    pub fn is_leader(&mut self, now_tick: u64) -> bool {
        self.leader(now_tick) == self.self_id
    }

    /// Highest configuration version any live peer has announced.
    pub fn newest_config_version(&self, now_tick: u64) -> Option<(AgentId, u64)> {
        self.peers
            .iter()
            .filter(|(&id, _)| self.is_live(id, now_tick))
            .map(|(&id, p)| (id, p.config_version))
            .max_by_key(|&(_, v)| v)
    }

    /// Compact view for the persisted state file.
    pub fn snapshot(&self) -> BTreeMap<AgentId, PeerSnapshot> {
        self.peers
            .iter()
            .map(|(&id, p)| {
                (
                    id,
                    PeerSnapshot {
                        status: p.status.to_string(),
                        fuel: p.fuel,
                        last_seen_tick: p.last_seen_tick,
                    },
                )
            })
            .collect()
    }
}
