//! Wire protocol: envelopes and the tagged message union.
//!
//! Every message rides in an [`Envelope`] carrying the sender id, a
//! per-sender monotonic sequence number, a wall-clock timestamp (operator
//! log only; liveness is tick-counted), and the quarry id that scopes the
//! protocol. Directed messages set `to`; broadcasts leave it empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QuarryConfig;
use crate::plan::{Tunnel, TunnelId, TunnelState};

/// Protocol string all envelopes are scoped by.
pub const PROTOCOL: &str = "auto_mine/1";

/// Numeric agent identity. Election is "lowest live id", so the ordering of
/// this type is load-bearing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Coarse agent state published in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    WaitingFuel,
    Homing,
    Home,
    Fault,
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Idle
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::WaitingFuel => "waiting_fuel",
            AgentStatus::Homing => "homing",
            AgentStatus::Home => "home",
            AgentStatus::Fault => "fault",
        };
        f.write_str(s)
    }
}

/// The message union. One variant per protocol row; payload schemas are
/// fixed per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Heartbeat {
        status: AgentStatus,
        /// Label of the active job, if any.
        job: Option<String>,
        fuel: u64,
        config_version: u64,
        /// Sender's local tick counter; the logical supplement to wall-clock
        /// freshness.
        tick: u64,
        /// Last error token, if the previous step failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    ConfigRequest,
    ConfigResponse {
        config: QuarryConfig,
    },
    ConfigUpdate {
        config: QuarryConfig,
    },
    /// Ask the leader for tunnel work.
    JobRequest,
    /// Leader hands a claimed tunnel to the requester.
    Assign {
        tunnel: Tunnel,
    },
    /// Return a tunnel to the leader with final progress and state.
    JobRelease {
        tunnel_id: TunnelId,
        progress: u32,
        state: TunnelState,
    },
    Recall {
        active: bool,
    },
    /// Announced once an agent has parked on the spawn column.
    HomeAck,
}

impl Message {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "heartbeat",
            Message::ConfigRequest => "config_request",
            Message::ConfigResponse { .. } => "config_response",
            Message::ConfigUpdate { .. } => "config_update",
            Message::JobRequest => "job_request",
            Message::Assign { .. } => "assign",
            Message::JobRelease { .. } => "job_release",
            Message::Recall { .. } => "recall",
            Message::HomeAck => "home_ack",
        }
    }
}

/// A routed message on the quarry protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    pub sender: AgentId,
    /// Monotonic per sender; receivers may rely on sender-FIFO ordering.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub quarry_id: String,
    /// Recipient for directed messages; `None` for broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<AgentId>,
    pub message: Message,
}

impl Envelope {
    /// Whether this envelope should be delivered to `agent` on `quarry`.
    pub fn addressed_to(&self, agent: AgentId, quarry: &str) -> bool {
        if self.protocol != PROTOCOL || self.quarry_id != quarry || self.sender == agent {
            return false;
        }
        match self.to {
            Some(target) => target == agent,
            None => true,
        }
    }
}
