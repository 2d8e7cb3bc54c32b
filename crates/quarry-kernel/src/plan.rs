//! Shared tunnel plan and the leader-owned mutex over it.
//!
//! The plan tiles the bounding box into 2x1 corridors along +z. Each agent
//! holds a replica; the acting leader is the only writer for mutex
//! transitions (idle -> claimed -> active -> done) and followers observe
//! through `assign` / `job_release` messages.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::QuarryConfig;
use crate::geometry::Pos;
use crate::messages::AgentId;

/// Stable tunnel identifier, ordered by enumeration ("T001", "T002", ...).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TunnelId(pub String);

impl TunnelId {
    pub fn from_index(index: usize) -> Self {
        Self(format!("T{:03}", index))
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Idle,
    Claimed,
    Active,
    Done,
}

/// One planned corridor: 2 tall, 1 wide, extending `length` cells along +z
/// from `origin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub origin: Pos,
    pub length: u32,
    /// Cells already cleared from the origin.
    pub progress: u32,
    pub state: TunnelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<AgentId>,
}

impl Tunnel {
    /// The floor cell the digger stands in: the last cleared corridor cell,
    /// or the origin while nothing is cleared yet.
    pub fn working_cell(&self) -> Pos {
        self.origin
            .offset(0, 0, self.progress.saturating_sub(1) as i32)
    }

    pub fn is_finished(&self) -> bool {
        self.progress >= self.length || self.state == TunnelState::Done
    }
}

/// The per-agent replica of the shared plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelPlan {
    pub tunnels: BTreeMap<TunnelId, Tunnel>,
}

impl TunnelPlan {
    /// Tile the bounding box: one tunnel per `(x, y)` lattice point with
    /// `x` stepped by `tunnel_spacing` and `y` by `layer_spacing`, each
    /// extending along +z and clipped to the box.
    pub fn generate(config: &QuarryConfig) -> Self {
        let mut tunnels = BTreeMap::new();
        let length = config.chunk_length.min(config.bounds.max_z as u32 + 1);
        let mut index = 1;
        let mut y = 0i32;
        while y <= config.bounds.max_y {
            let mut x = 0i32;
            while x <= config.bounds.max_x {
                let id = TunnelId::from_index(index);
                tunnels.insert(
                    id.clone(),
                    Tunnel {
                        id,
                        origin: Pos::new(x, y, 0),
                        length,
                        progress: 0,
                        state: TunnelState::Idle,
                        claimed_by: None,
                    },
                );
                index += 1;
                x += config.tunnel_spacing as i32;
            }
            y += config.layer_spacing as i32;
        }
        debug_assert!(Self::spacing_holds(&tunnels));
        Self { tunnels }
    }

    /// The spacing invariant: any two distinct origins differ by at least 3
    /// on the x axis or at least 3 on the y axis.
    fn spacing_holds(tunnels: &BTreeMap<TunnelId, Tunnel>) -> bool {
        let origins: Vec<Pos> = tunnels.values().map(|t| t.origin).collect();
        for (i, a) in origins.iter().enumerate() {
            for b in origins.iter().skip(i + 1) {
                if (a.x, a.y) != (b.x, b.y) && (a.x - b.x).abs() < 3 && (a.y - b.y).abs() < 3 {
                    return false;
                }
            }
        }
        true
    }

    pub fn get(&self, id: &TunnelId) -> Option<&Tunnel> {
        self.tunnels.get(id)
    }

    /// First idle tunnel in enumeration order, if any.
    pub fn first_idle(&self) -> Option<&Tunnel> {
        self.tunnels
            .values()
            .find(|t| t.state == TunnelState::Idle)
    }

    /// The tunnel currently claimed by `agent`, if any. Used both for crash
    /// recovery and to keep repeated `job_request`s idempotent at the leader.
    pub fn claimed_by(&self, agent: AgentId) -> Option<&Tunnel> {
        self.tunnels.values().find(|t| {
            t.claimed_by == Some(agent)
                && matches!(t.state, TunnelState::Claimed | TunnelState::Active)
        })
    }

    pub fn all_done(&self) -> bool {
        self.tunnels.values().all(|t| t.state == TunnelState::Done)
    }

    /// Leader-side transition: claim the tunnel for `agent`.
    pub fn claim(&mut self, id: &TunnelId, agent: AgentId) -> bool {
        match self.tunnels.get_mut(id) {
            Some(t) if t.state == TunnelState::Idle => {
                t.state = TunnelState::Claimed;
                t.claimed_by = Some(agent);
                info!(tunnel = %id, agent = %agent, "Tunnel claimed");
                true
            }
            _ => false,
        }
    }

    /// Mark the agent's claimed tunnel as actively being dug.
    pub fn activate(&mut self, id: &TunnelId, agent: AgentId) {
        if let Some(t) = self.tunnels.get_mut(id) {
            if t.claimed_by == Some(agent) && t.state == TunnelState::Claimed {
                t.state = TunnelState::Active;
            }
        }
    }

    /// Record forward progress on the agent's own replica.
    pub fn record_progress(&mut self, id: &TunnelId, progress: u32) {
        if let Some(t) = self.tunnels.get_mut(id) {
            if progress > t.progress {
                t.progress = progress;
            }
        }
    }

    /// Leader-side transition: accept a release from `agent`.
    ///
    /// Duplicate-claim reconciliation lives here: a release from an agent
    /// that no longer holds the tunnel is kept only if it reports strictly
    /// greater progress, with the lower agent id winning ties.
    pub fn release(
        &mut self,
        id: &TunnelId,
        agent: AgentId,
        progress: u32,
        state: TunnelState,
    ) {
        let Some(t) = self.tunnels.get_mut(id) else {
            warn!(tunnel = %id, agent = %agent, "Release for unknown tunnel");
            return;
        };
        let holder = t.claimed_by;
        let accept = match holder {
            Some(h) if h == agent => true,
            Some(h) => progress > t.progress || (progress == t.progress && agent < h),
            None => true,
        };
        if !accept {
            info!(
                tunnel = %id,
                agent = %agent,
                holder = ?holder,
                "Release ignored: further-progressed claim retained"
            );
            return;
        }
        t.progress = t.progress.max(progress);
        t.state = state;
        t.claimed_by = match state {
            TunnelState::Idle | TunnelState::Done => None,
            _ => Some(agent),
        };
        info!(
            tunnel = %id,
            agent = %agent,
            progress = t.progress,
            state = ?t.state,
            "Tunnel released"
        );
    }

    /// Apply an assignment observed from the leader, replacing the local
    /// record wholesale.
    pub fn merge_assignment(&mut self, tunnel: Tunnel) {
        self.tunnels.insert(tunnel.id.clone(), tunnel);
    }

    /// New-leader duty: return claims held by dead peers to `idle`,
    /// preserving progress. Returns the reclaimed ids.
    pub fn reclaim_dead(&mut self, live: &BTreeSet<AgentId>) -> Vec<TunnelId> {
        let mut reclaimed = Vec::new();
        for t in self.tunnels.values_mut() {
            if matches!(t.state, TunnelState::Claimed | TunnelState::Active) {
                if let Some(holder) = t.claimed_by {
                    if !live.contains(&holder) {
                        t.state = TunnelState::Idle;
                        t.claimed_by = None;
                        reclaimed.push(t.id.clone());
                    }
                }
            }
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed tunnels from dead peers");
        }
        reclaimed
    }

    /// Re-tile after a configuration change: tunnels that still fit keep
    /// their progress; tunnels outside the new box are dropped; newly tiled
    /// origins are added idle.
    pub fn retile(&mut self, config: &QuarryConfig) {
        let fresh = Self::generate(config);
        let mut merged = BTreeMap::new();
        for (id, mut tunnel) in fresh.tunnels {
            if let Some(old) = self
                .tunnels
                .values()
                .find(|t| t.origin == tunnel.origin)
            {
                tunnel.progress = old.progress.min(tunnel.length);
                tunnel.state = old.state;
                tunnel.claimed_by = old.claimed_by;
                if tunnel.progress >= tunnel.length {
                    tunnel.state = TunnelState::Done;
                    tunnel.claimed_by = None;
                }
            }
            merged.insert(id, tunnel);
        }
        debug!(
            before = self.tunnels.len(),
            after = merged.len(),
            "Plan re-tiled for new configuration"
        );
        self.tunnels = merged;
    }

    /// Test-visible form of the spacing invariant.
    pub fn validate_spacing(&self) -> bool {
        Self::spacing_holds(&self.tunnels)
    }
}
