//! Fleet runner: N agents over a loopback hub against one simulated world.
//!
//! Each agent is one tokio task running its worker loop to completion. An
//! optional UDP bridge forwards operator datagrams (`recall`,
//! `config_update`) from the network onto the in-process hub, so the
//! `automine recall` command reaches a running fleet.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use quarry_kernel::{
    AgentBus, AgentId, LoopbackHub, QuarryConfig, StateStore, UdpBus, Worker,
};

use crate::report::{AgentReport, FleetReport};
use crate::sim::{SimConfig, SimWorld};

/// Identity of the UDP-to-loopback bridge. Never heartbeats, never elected.
const BRIDGE_ID: AgentId = AgentId(u32::MAX);

/// Everything a fleet run needs.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub quarry: QuarryConfig,
    pub agents: u32,
    pub max_ticks: u64,
    pub data_dir: PathBuf,
    pub sim: SimConfig,
    /// Bus receive timeout per tick.
    pub recv_timeout: Duration,
    /// Listen for operator datagrams on this port and bridge them in.
    pub udp_port: Option<u16>,
}

impl FleetConfig {
    pub fn new(quarry: QuarryConfig, agents: u32, data_dir: PathBuf) -> Self {
        Self {
            quarry,
            agents,
            max_ticks: 100_000,
            data_dir,
            sim: SimConfig::default(),
            recv_timeout: Duration::from_millis(10),
            udp_port: None,
        }
    }
}

pub struct FleetRunner {
    config: FleetConfig,
}

impl FleetRunner {
    pub fn new(config: FleetConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<FleetReport> {
        let started_at = Utc::now();
        let quarry = &self.config.quarry;
        let world = SimWorld::build(quarry, &self.config.sim);
        let hub = LoopbackHub::new();
        let stop = Arc::new(AtomicBool::new(false));

        info!(
            quarry = %quarry.quarry_id,
            agents = self.config.agents,
            max_ticks = self.config.max_ticks,
            "Fleet starting"
        );

        let bridge = match self.config.udp_port {
            Some(port) => Some(tokio::spawn(Self::udp_bridge(
                UdpBus::bind(BRIDGE_ID, &quarry.quarry_id, port)
                    .await
                    .with_context(|| format!("binding operator bridge on UDP port {port}"))?,
                hub.clone(),
                stop.clone(),
            ))),
            None => None,
        };

        let mut tasks = Vec::new();
        for i in 0..self.config.agents {
            let id = AgentId(i + 1);
            let handle = world.add_agent(id, i as i32, quarry.spawn_facing);
            let store = StateStore::open(
                self.config.data_dir.join(format!("agent-{}", id.0)),
                &quarry.quarry_id,
            )?;
            let bus = AgentBus::Loopback(hub.endpoint(id, &quarry.quarry_id));
            let mut worker = Worker::new(id, quarry.clone(), Box::new(handle), bus, store)?;
            worker.set_recv_timeout(self.config.recv_timeout);

            let max_ticks = self.config.max_ticks;
            let stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = worker.run(max_ticks, &stop).await;
                (worker, outcome)
            }));
        }

        let mut agents = Vec::new();
        let mut plan_holder: Option<Worker> = None;
        for joined in join_all(tasks).await {
            let (worker, outcome) = joined.context("agent task panicked")?;
            if let Err(e) = outcome {
                warn!(agent = %worker.id(), error = %e, "Agent stopped with error");
            }
            agents.push(AgentReport::collect(&worker));
            // The lowest id's replica is the most authoritative plan view.
            let replace = plan_holder
                .as_ref()
                .map(|held| worker.id() < held.id())
                .unwrap_or(true);
            if replace {
                plan_holder = Some(worker);
            }
        }

        stop.store(true, Ordering::Relaxed);
        if let Some(bridge) = bridge {
            bridge.abort();
        }

        let report = FleetReport::new(
            quarry.quarry_id.clone(),
            started_at,
            agents,
            plan_holder.as_ref(),
        );
        info!(
            tunnels_done = report.tunnels_done,
            tunnels_total = report.tunnels_total,
            blocks = report.blocks_mined(),
            "Fleet finished"
        );
        Ok(report)
    }

    /// Forward operator datagrams onto the in-process hub.
    async fn udp_bridge(mut udp: UdpBus, hub: LoopbackHub, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            if let Some(envelope) = udp.recv(Duration::from_millis(500)).await {
                info!(kind = envelope.message.label(), sender = %envelope.sender, "Operator datagram bridged");
                hub.inject(envelope);
            }
        }
    }
}
