//! Run reports: per-agent metrics collected after a fleet run.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quarry_kernel::{Metrics, Pose, TunnelState, Worker};

/// Final accounting for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub id: u32,
    pub ticks: u64,
    pub final_pose: Pose,
    pub status: String,
    pub metrics: Metrics,
}

impl AgentReport {
    pub fn collect(worker: &Worker) -> Self {
        Self {
            id: worker.id().0,
            ticks: worker.ticks(),
            final_pose: worker.pose(),
            status: worker.status().to_string(),
            metrics: worker.state().metrics.clone(),
        }
    }
}

/// Whole-fleet summary written as JSON at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport {
    pub quarry_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub agents: Vec<AgentReport>,
    pub tunnels_total: usize,
    pub tunnels_done: usize,
    /// Tunnel states by name, for a quick operator read.
    pub tunnel_states: HashMap<String, String>,
}

impl FleetReport {
    pub fn new(
        quarry_id: String,
        started_at: DateTime<Utc>,
        agents: Vec<AgentReport>,
        plan_holder: Option<&Worker>,
    ) -> Self {
        let (tunnels_total, tunnels_done, tunnel_states) = match plan_holder {
            Some(worker) => {
                let plan = &worker.state().tunnels;
                let done = plan
                    .tunnels
                    .values()
                    .filter(|t| t.state == TunnelState::Done)
                    .count();
                let states = plan
                    .tunnels
                    .iter()
                    .map(|(id, t)| (id.to_string(), format!("{:?}", t.state).to_lowercase()))
                    .collect();
                (plan.tunnels.len(), done, states)
            }
            None => (0, 0, HashMap::new()),
        };
        Self {
            quarry_id,
            started_at,
            ended_at: Utc::now(),
            agents,
            tunnels_total,
            tunnels_done,
            tunnel_states,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        Ok(())
    }

    pub fn blocks_mined(&self) -> u64 {
        self.agents.iter().map(|a| a.metrics.blocks_mined).sum()
    }
}
