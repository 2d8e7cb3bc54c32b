//! The per-agent worker loop.
//!
//! One tick: resume the journal if anything is pending, drain the bus,
//! perform leader duties, enqueue system jobs, run one bounded step of the
//! active job, heartbeat if due. Every state mutation is durable before the
//! next step, and every natural wait surfaces as a job re-queue with
//! backoff rather than a blocking call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bus::AgentBus;
use crate::config::QuarryConfig;
use crate::error::{MineError, Result};
use crate::geometry::{Dir, Pos, Pose};
use crate::jobs::{Job, JobKind, JobQueue};
use crate::journal::{
    BroadcastPayload, ClaimPayload, DigPayload, EffectEntry, EffectKind, EffectVerifier, Journal,
    MovePayload, ReleasePayload, TurnPayload,
};
use crate::membership::Membership;
use crate::messages::{AgentId, AgentStatus, Envelope, Message};
use crate::movement::Movement;
use crate::navigator::{self, NavStep};
use crate::ore::OreStatus;
use crate::plan::{TunnelId, TunnelPlan, TunnelState};
use crate::store::{PersistedState, StateStore};
use crate::supply::{self, SupplyOutcome};
use crate::world::{Face, World, AGENT_BLOCK};

/// Ticks between repeated `job_request`s while no assignment arrives.
const REQUEST_RETRY_TICKS: u64 = 8;

/// Initial empty-chest backoff; doubles up to [`MAX_BACKOFF_TICKS`].
const BASE_BACKOFF_TICKS: u64 = 4;
const MAX_BACKOFF_TICKS: u64 = 64;

/// Messages handled per tick before yielding to the job step.
const DRAIN_BUDGET: usize = 64;

/// What one job step accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Done,
    Progress,
    /// Nothing to do until the world changes; re-queue with backoff.
    Waiting,
}

/// Calibration preamble state: descend to the floor, backing off upward when
/// stacked on another agent.
#[derive(Debug, Default)]
struct Calibration {
    attempts: u32,
    climb_left: u32,
    wait_ticks: u64,
}

/// In-memory vein flood-fill state. Deliberately not persisted: after a
/// crash the ore registry's queued entries regenerate the work.
#[derive(Debug)]
struct ActiveVein {
    origin: Pos,
    block: String,
    frontier: VecDeque<Pos>,
    /// Cleared cells still awaiting an in-place neighbour scan.
    to_scan: VecDeque<Pos>,
    mined: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct CalibratePayload {}

/// One agent's coordination process. All components are injected at
/// construction; the worker owns them for its lifetime.
pub struct Worker {
    id: AgentId,
    config: QuarryConfig,
    world: Box<dyn World>,
    bus: AgentBus,
    store: StateStore,
    state: PersistedState,
    journal: Journal,
    movement: Movement,
    queue: JobQueue,
    membership: Membership,
    tick: u64,
    last_heartbeat_tick: Option<u64>,
    status: AgentStatus,
    last_error: Option<String>,
    vein: Option<ActiveVein>,
    /// Config version a live peer announced that we have not applied yet.
    drift_from: Option<u64>,
    request_sent_tick: Option<u64>,
    waiting_until: u64,
    backoff: u64,
    calibration: Calibration,
    home_acked: bool,
    /// Set when journal replay could not confirm an entry; destructive
    /// progress is refused until it clears.
    journal_halted: bool,
    recv_timeout: Duration,
}

impl Worker {
    pub fn new(
        id: AgentId,
        config: QuarryConfig,
        world: Box<dyn World>,
        bus: AgentBus,
        store: StateStore,
    ) -> Result<Self> {
        config.validate()?;
        let journal = Journal::load(&store)?;
        let queue = JobQueue::replay(store.load_job_records()?);

        let mut state = match store.load_state()? {
            Some(state) => state,
            None => {
                let mut fresh = PersistedState::default();
                fresh.config_version = config.config_version;
                fresh.tunnels = TunnelPlan::generate(&config);
                store.save_state(&fresh)?;
                fresh
            }
        };
        if state.config_version < config.config_version {
            state.config_version = config.config_version;
            state.tunnels.retile(&config);
            store.save_state(&state)?;
        }
        if store.load_config()?.is_none() {
            store.save_config(&config)?;
        }

        let mut movement = Movement::new(state.pose, config.bounds, config.clear_retry_limit);
        if state.calibrated {
            movement.engage_bounds();
        }
        let membership = Membership::new(id, config.heartbeat_timeout_ticks);

        info!(
            agent = %id,
            quarry = %config.quarry_id,
            calibrated = state.calibrated,
            pending_journal = journal.pending_len(),
            "Worker ready"
        );

        Ok(Self {
            id,
            config,
            world,
            bus,
            store,
            state,
            journal,
            movement,
            queue,
            membership,
            tick: 0,
            last_heartbeat_tick: None,
            status: AgentStatus::Idle,
            last_error: None,
            vein: None,
            drift_from: None,
            request_sent_tick: None,
            waiting_until: 0,
            backoff: BASE_BACKOFF_TICKS,
            calibration: Calibration::default(),
            home_acked: false,
            journal_halted: false,
            recv_timeout: Duration::from_millis(25),
        })
    }

    // ── accessors (fleet runner and tests) ──

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn pose(&self) -> Pose {
        self.movement.pose()
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn active_job(&self) -> Option<&Job> {
        self.queue.active()
    }

    /// Whether a job with this kind label is pending or active.
    pub fn has_live_job(&self, label: &str) -> bool {
        self.queue.has_live(label)
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn leader_view(&mut self) -> AgentId {
        self.membership.leader(self.tick)
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn config(&self) -> &QuarryConfig {
        &self.config
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) {
        self.recv_timeout = timeout;
    }

    /// All planned work finished and nothing queued or pending.
    pub fn is_done(&self) -> bool {
        self.state.calibrated
            && !self.state.recall
            && self.state.tunnels.all_done()
            && self.queue.is_idle()
            && self.state.ore.queued_count() == 0
            && self.journal.is_empty()
    }

    /// Run ticks until `max_ticks`, the stop flag, or completion.
    pub async fn run(&mut self, max_ticks: u64, stop: &AtomicBool) -> Result<()> {
        while self.tick < max_ticks {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            self.tick_once().await?;
            if self.is_done() {
                info!(agent = %self.id, ticks = self.tick, "Quarry work complete");
                break;
            }
        }
        Ok(())
    }

    /// One full tick. Public so harnesses can drive agents deterministically.
    pub async fn tick_once(&mut self) -> Result<()> {
        self.tick += 1;

        if !self.journal.is_empty() {
            self.resume_journal().await?;
        }

        self.drain_bus().await?;

        if self.membership.is_leader(self.tick) {
            let live = self.membership.live_set(self.tick);
            let reclaimed = self.state.tunnels.reclaim_dead(&live);
            if !reclaimed.is_empty() {
                self.store.save_state(&self.state)?;
            }
        }

        self.enqueue_system_jobs()?;

        if !self.state.calibrated {
            if !self.journal_halted {
                self.calibration_step()?;
            }
            self.heartbeat_if_due().await?;
            return Ok(());
        }

        self.acquire_work().await?;

        if !self.journal_halted && self.tick >= self.waiting_until {
            self.run_job_step().await?;
        }

        self.heartbeat_if_due().await?;
        Ok(())
    }

    // ── journal replay ──

    async fn resume_journal(&mut self) -> Result<()> {
        let mut outbox: Vec<(Option<AgentId>, Message)> = Vec::new();
        let outcome = {
            let mut verifier = ReplayVerifier {
                world: self.world.as_mut(),
                movement: &mut self.movement,
                state: &mut self.state,
                store: &self.store,
                outbox: &mut outbox,
            };
            self.journal.resume(&self.store, &mut verifier)?
        };
        for (to, message) in outbox {
            self.bus.send(to, message).await?;
        }
        if outcome.is_clean() {
            if self.journal_halted {
                info!(agent = %self.id, "Journal replay clean; resuming normal work");
            }
            self.journal_halted = false;
        } else {
            let (id, kind) = outcome.halted_at.expect("unclean resume names an entry");
            error!(
                agent = %self.id,
                entry = id,
                kind = %kind,
                "OPERATOR: journal entry unverified, job progress halted"
            );
            self.journal_halted = true;
            self.status = AgentStatus::Fault;
            self.last_error = Some(
                MineError::Unverified { id, kind }.status_token().to_string(),
            );
        }
        Ok(())
    }

    // ── bus handling ──

    async fn drain_bus(&mut self) -> Result<()> {
        let mut timeout = self.recv_timeout;
        for _ in 0..DRAIN_BUDGET {
            let Some(envelope) = self.bus.recv(timeout).await else {
                break;
            };
            timeout = Duration::ZERO;
            self.handle_envelope(envelope).await?;
        }
        Ok(())
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        let sender = envelope.sender;
        match envelope.message {
            Message::Heartbeat {
                status,
                job,
                fuel,
                config_version,
                tick,
                last_error: _,
            } => {
                self.membership
                    .observe_heartbeat(sender, status, job, fuel, config_version, tick, self.tick);
                self.state.peers = self.membership.snapshot();
                if config_version > self.config.config_version && self.drift_from.is_none() {
                    warn!(
                        agent = %self.id,
                        local = self.config.config_version,
                        remote = config_version,
                        "Configuration drift detected; halting destructive jobs"
                    );
                    self.drift_from = Some(config_version);
                    self.last_error = Some(
                        MineError::ConfigDrift {
                            local: self.config.config_version,
                            remote: config_version,
                        }
                        .status_token()
                        .to_string(),
                    );
                    self.bus.send(Some(sender), Message::ConfigRequest).await?;
                }
            }
            Message::ConfigRequest => {
                self.bus
                    .send(
                        Some(sender),
                        Message::ConfigResponse {
                            config: self.config.clone(),
                        },
                    )
                    .await?;
            }
            Message::ConfigResponse { config } | Message::ConfigUpdate { config } => {
                if self.apply_config(config)? {
                    // Gossip the applied version onward once.
                    let config = self.config.clone();
                    self.bus.send(None, Message::ConfigUpdate { config }).await?;
                }
            }
            Message::JobRequest => self.handle_job_request(sender).await?,
            Message::Assign { tunnel } => self.handle_assignment(tunnel)?,
            Message::JobRelease {
                tunnel_id,
                progress,
                state,
            } => {
                // Releases are broadcast; every replica applies them so that
                // completion converges fleet-wide, with the same
                // reconciliation rules the leader uses.
                self.state.tunnels.release(&tunnel_id, sender, progress, state);
                self.store.save_state(&self.state)?;
            }
            Message::Recall { active } => {
                info!(agent = %self.id, active = active, "Recall signal");
                self.state.recall = active;
                if active {
                    // Recall must pre-empt even a fuel-wait backoff.
                    self.waiting_until = 0;
                }
                if !active {
                    self.home_acked = false;
                    if matches!(
                        self.queue.active().map(|j| &j.kind),
                        Some(JobKind::Recall)
                    ) {
                        self.queue.complete_active(&self.store)?;
                        self.status = AgentStatus::Idle;
                    }
                }
                self.store.save_state(&self.state)?;
            }
            Message::HomeAck => {
                debug!(agent = %self.id, peer = %sender, "Peer reported home");
            }
        }
        Ok(())
    }

    /// Leader path for `job_request`: re-assign the requester's existing
    /// claim if it has one (keeps retries idempotent), otherwise claim the
    /// first idle tunnel for it.
    async fn handle_job_request(&mut self, requester: AgentId) -> Result<()> {
        if !self.membership.is_leader(self.tick) {
            return Ok(());
        }
        let tunnel = if let Some(existing) = self.state.tunnels.claimed_by(requester) {
            Some(existing.clone())
        } else if let Some(idle) = self.state.tunnels.first_idle().map(|t| t.id.clone()) {
            self.state.tunnels.claim(&idle, requester);
            self.store.save_state(&self.state)?;
            self.state.tunnels.get(&idle).cloned()
        } else {
            None
        };
        if let Some(tunnel) = tunnel {
            self.bus
                .send(Some(requester), Message::Assign { tunnel })
                .await?;
        }
        Ok(())
    }

    fn handle_assignment(&mut self, tunnel: crate::plan::Tunnel) -> Result<()> {
        if tunnel.claimed_by != Some(self.id) {
            return Ok(());
        }
        let id = self.journal.begin(
            &self.store,
            EffectKind::ClaimTunnel,
            &ClaimPayload {
                tunnel: tunnel.clone(),
            },
        )?;
        let tunnel_id = tunnel.id.clone();
        self.state.tunnels.merge_assignment(tunnel);
        self.store.save_state(&self.state)?;
        self.journal.complete(&self.store, id)?;
        self.request_sent_tick = None;
        if !self.queue.has_live("tunnel_mine") {
            self.queue
                .enqueue(&self.store, JobKind::TunnelMine { tunnel_id })?;
        }
        Ok(())
    }

    /// Returns true when the blob was newer and applied.
    fn apply_config(&mut self, new: QuarryConfig) -> Result<bool> {
        if new.quarry_id != self.config.quarry_id
            || new.config_version <= self.config.config_version
        {
            return Ok(false);
        }
        if let Err(e) = new.validate() {
            warn!(agent = %self.id, error = %e, "Rejecting invalid config update");
            return Ok(false);
        }
        info!(
            agent = %self.id,
            from = self.config.config_version,
            to = new.config_version,
            "Applying configuration update"
        );
        self.config = new;
        self.movement.set_bounds(self.config.bounds);
        self.membership.set_timeout(self.config.heartbeat_timeout_ticks);
        self.state.config_version = self.config.config_version;
        self.state.tunnels.retile(&self.config);
        self.store.save_config(&self.config)?;
        self.drift_from = None;

        // Re-validate containment: a shrunken box recalls anyone outside it.
        if self.state.calibrated && !self.movement.in_bounds() {
            warn!(agent = %self.id, pose = %self.movement.pose(), "Pose outside new bounding box; recalling");
            self.queue.enqueue(&self.store, JobKind::Recall)?;
            self.waiting_until = 0;
        }
        self.store.save_state(&self.state)?;
        Ok(true)
    }

    // ── system jobs and work acquisition ──

    fn enqueue_system_jobs(&mut self) -> Result<()> {
        if self.state.recall {
            self.queue.enqueue(&self.store, JobKind::Recall)?;
        }
        if self.state.calibrated && self.world.fuel_level() < self.config.fuel_reserve {
            self.queue.enqueue(&self.store, JobKind::Refuel)?;
        }
        Ok(())
    }

    async fn acquire_work(&mut self) -> Result<()> {
        if !self.queue.is_idle()
            || self.state.recall
            || self.drift_from.is_some()
            || self.journal_halted
        {
            return Ok(());
        }

        // Crash recovery: a tunnel already claimed for us resumes directly.
        if let Some(t) = self.state.tunnels.claimed_by(self.id) {
            if !t.is_finished() {
                let tunnel_id = t.id.clone();
                self.queue
                    .enqueue(&self.store, JobKind::TunnelMine { tunnel_id })?;
                return Ok(());
            }
        }

        // Observed ore that never got a job (crash between scan and enqueue).
        if let Some(entry) = self.state.ore.next_queued() {
            let kind = JobKind::OreMine {
                pos: entry.pos,
                block: entry.block.clone(),
            };
            self.queue.enqueue(&self.store, kind)?;
            return Ok(());
        }

        if self.state.tunnels.first_idle().is_none() {
            return Ok(());
        }

        let leader = self.membership.leader(self.tick);
        if leader == self.id {
            // Self-assignment: the leader runs the same claim transition it
            // would run for a peer.
            if let Some(idle) = self.state.tunnels.first_idle().map(|t| t.id.clone()) {
                self.state.tunnels.claim(&idle, self.id);
                if let Some(tunnel) = self.state.tunnels.get(&idle).cloned() {
                    self.handle_assignment(tunnel)?;
                }
            }
        } else {
            let due = self
                .request_sent_tick
                .map(|t| self.tick.saturating_sub(t) >= REQUEST_RETRY_TICKS)
                .unwrap_or(true);
            if due {
                if self.request_sent_tick.is_some() {
                    // The previous request went unanswered.
                    warn!(agent = %self.id, leader = %leader, "Leader did not answer job request; retrying");
                    self.last_error = Some(
                        MineError::PeerUnreachable(leader).status_token().to_string(),
                    );
                }
                debug!(agent = %self.id, leader = %leader, "Requesting tunnel work");
                self.bus.send(Some(leader), Message::JobRequest).await?;
                self.request_sent_tick = Some(self.tick);
            }
        }
        Ok(())
    }

    // ── job execution ──

    async fn run_job_step(&mut self) -> Result<()> {
        // A freshly queued higher-priority job (recall, refuel) pre-empts the
        // active one within a single step.
        if let (Some(active), Some(min)) = (self.queue.active(), self.queue.min_pending_priority())
        {
            if active.priority > min {
                self.queue.yield_active(&self.store)?;
            }
        }

        if self.queue.active().is_none() {
            // The worst-case fuel gate runs at claim time.
            let next = self.queue.peek().map(|j| (j.id, j.kind.clone()));
            if let Some((job_id, kind)) = next {
                let ok = supply::has_fuel_for(
                    &kind,
                    self.world.fuel_level(),
                    self.movement.pose().pos,
                    &self.state.tunnels,
                    &self.config,
                );
                if !ok {
                    if self.world.fuel_level() >= self.config.target_fuel {
                        // Already at the refuel target and still short: this
                        // job can never be afforded. Drop it rather than loop.
                        warn!(agent = %self.id, job = job_id, "Job unaffordable at target fuel; dropping");
                        if self.queue.pop(&self.store)?.is_some() {
                            self.queue.fail_active(&self.store, false, self.config.max_job_failures)?;
                            self.state.metrics.jobs_failed += 1;
                            self.store.save_state(&self.state)?;
                        }
                        return Ok(());
                    }
                    debug!(agent = %self.id, job = job_id, "Insufficient fuel; refuel first");
                    self.queue.enqueue(&self.store, JobKind::Refuel)?;
                }
            }
            if self.queue.pop(&self.store)?.is_none() {
                if !self.state.recall {
                    self.status = AgentStatus::Idle;
                }
                return Ok(());
            }
        }

        let Some(active) = self.queue.active().cloned() else {
            return Ok(());
        };

        // Drift halts destructive jobs; recall and refuel stay runnable.
        if self.drift_from.is_some()
            && !matches!(active.kind, JobKind::Recall | JobKind::Refuel)
        {
            self.queue.yield_active(&self.store)?;
            return Ok(());
        }

        let result = match active.kind.clone() {
            JobKind::Recall => self.step_recall().await,
            JobKind::Refuel => self.step_refuel(),
            JobKind::OreMine { pos, block } => self.step_ore(pos, &block),
            JobKind::TunnelMine { tunnel_id } => self.step_tunnel(&tunnel_id).await,
        };

        match result {
            Ok(StepOutcome::Done) => {
                self.queue.complete_active(&self.store)?;
                self.state.metrics.jobs_completed += 1;
                self.store.save_state(&self.state)?;
                self.backoff = BASE_BACKOFF_TICKS;
                self.status = AgentStatus::Idle;
            }
            Ok(StepOutcome::Progress) => {
                self.backoff = BASE_BACKOFF_TICKS;
            }
            Ok(StepOutcome::Waiting) => {
                self.queue.yield_active(&self.store)?;
                self.waiting_until = self.tick + self.backoff;
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF_TICKS);
            }
            Err(e) => self.handle_step_error(e)?,
        }
        Ok(())
    }

    fn handle_step_error(&mut self, e: MineError) -> Result<()> {
        self.last_error = Some(e.status_token().to_string());
        match e {
            MineError::OutOfBounds(pos) => {
                error!(agent = %self.id, target = %pos, "Step left the bounding box; failing job");
                self.store
                    .append_log(&format!("job failed out of bounds at {pos}"))?;
                self.queue.fail_active(&self.store, false, self.config.max_job_failures)?;
                self.state.metrics.jobs_failed += 1;
                self.store.save_state(&self.state)?;
                self.vein = None;
            }
            MineError::Blocked { attempts } => {
                warn!(agent = %self.id, attempts = attempts, "Step blocked; re-queueing job");
                self.queue
                    .fail_active(&self.store, true, self.config.max_job_failures)?;
            }
            MineError::FuelExhausted { level, needed } => {
                warn!(agent = %self.id, level = level, needed = needed, "Fuel exhausted; escalating refuel");
                self.queue.enqueue(&self.store, JobKind::Refuel)?;
                self.queue.yield_active(&self.store)?;
                self.status = AgentStatus::WaitingFuel;
            }
            MineError::ChestEmpty(_) => {
                self.queue.yield_active(&self.store)?;
                self.waiting_until = self.tick + self.backoff;
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF_TICKS);
                self.status = AgentStatus::WaitingFuel;
            }
            MineError::PeerUnreachable(peer) => {
                warn!(agent = %self.id, peer = %peer, "Peer unreachable; re-queueing job");
                self.queue
                    .fail_active(&self.store, true, self.config.max_job_failures)?;
            }
            // Persistence and protocol failures are not job failures.
            other => return Err(other),
        }
        Ok(())
    }

    // ── calibration ──

    fn calibration_step(&mut self) -> Result<()> {
        let facing = navigator::face(
            &mut self.movement,
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
            self.config.spawn_facing,
        )?;
        if !facing {
            return Ok(());
        }

        if self.calibration.wait_ticks > 0 {
            self.calibration.wait_ticks -= 1;
            return Ok(());
        }
        if self.calibration.climb_left > 0 {
            self.calibration.climb_left -= 1;
            match self.movement.up(
                self.world.as_mut(),
                &mut self.journal,
                &self.store,
                &mut self.state,
            ) {
                Ok(()) | Err(MineError::Blocked { .. }) => {}
                Err(e) => return self.soften_calibration_error(e),
            }
            if self.calibration.climb_left == 0 {
                self.calibration.wait_ticks = 1 << self.calibration.attempts.min(6);
            }
            return Ok(());
        }

        match self.movement.descend(
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
        ) {
            Ok(()) => Ok(()),
            Err(MineError::Blocked { .. }) => {
                if self.world.inspect(Face::Down).as_deref() == Some(AGENT_BLOCK) {
                    // Stacked on a peer still settling: climb away and retry.
                    self.calibration.attempts += 1;
                    self.calibration.climb_left = self.config.max_climb;
                    debug!(
                        agent = %self.id,
                        attempt = self.calibration.attempts,
                        "Calibration blocked by stacked agent; backing off"
                    );
                    Ok(())
                } else {
                    self.finish_calibration()
                }
            }
            Err(e) => self.soften_calibration_error(e),
        }
    }

    fn soften_calibration_error(&mut self, e: MineError) -> Result<()> {
        match e {
            MineError::FuelExhausted { .. } => {
                self.status = AgentStatus::WaitingFuel;
                self.last_error = Some(e.status_token().to_string());
                Ok(())
            }
            other => Err(other),
        }
    }

    fn finish_calibration(&mut self) -> Result<()> {
        let id = self
            .journal
            .begin(&self.store, EffectKind::Calibrate, &CalibratePayload {})?;
        // Localization fixes the frame; without it the floor we found IS the
        // origin by definition.
        let pose = self
            .world
            .locate()
            .unwrap_or(Pose::new(Pos::ORIGIN, self.config.spawn_facing));
        self.state.calibrated = true;
        self.movement.adopt_pose(pose, &self.store, &mut self.state)?;
        self.movement.engage_bounds();
        self.journal.complete(&self.store, id)?;
        info!(agent = %self.id, pose = %pose, "Calibrated");
        Ok(())
    }

    // ── job steps ──

    async fn step_recall(&mut self) -> Result<StepOutcome> {
        self.status = AgentStatus::Homing;

        if supply::has_cargo(self.world.as_ref(), &self.config) {
            let stand = self.config.chest_stand(self.config.deposit_offset);
            if self.movement.pose().pos != stand {
                self.corridor_step(stand)?;
                return Ok(StepOutcome::Progress);
            }
            if !self.face_step(self.config.chest_facing())? {
                return Ok(StepOutcome::Progress);
            }
            supply::deposit_round(
                self.world.as_mut(),
                &mut self.journal,
                &self.store,
                &mut self.state,
                &self.config,
            )?;
            return Ok(StepOutcome::Progress);
        }

        let pos = self.movement.pose().pos;
        if pos.x != 0 || pos.z != 0 {
            self.corridor_step(Pos::ORIGIN)?;
            return Ok(StepOutcome::Progress);
        }

        // On the column: climb until the next agent or the ceiling.
        match self.movement.up(
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
        ) {
            Ok(()) => Ok(StepOutcome::Progress),
            Err(MineError::Blocked { .. }) | Err(MineError::OutOfBounds(_)) => {
                if !self.home_acked {
                    self.send_journalled(None, Message::HomeAck).await?;
                    self.home_acked = true;
                    info!(agent = %self.id, pose = %self.movement.pose(), "Parked on spawn column");
                }
                self.status = AgentStatus::Home;
                if self.state.recall {
                    // Hold the column until the recall clears.
                    Ok(StepOutcome::Progress)
                } else {
                    // Recalled by a config change, not a fleet signal: done.
                    Ok(StepOutcome::Done)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn step_refuel(&mut self) -> Result<StepOutcome> {
        let stand = self.config.chest_stand(self.config.fuel_chest_offset);
        if self.movement.pose().pos != stand {
            self.status = AgentStatus::Working;
            self.corridor_step(stand)?;
            return Ok(StepOutcome::Progress);
        }
        if !self.face_step(self.config.chest_facing())? {
            return Ok(StepOutcome::Progress);
        }
        match supply::refuel_round(
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
            &self.config,
        )? {
            SupplyOutcome::Done => Ok(StepOutcome::Done),
            SupplyOutcome::InProgress => Ok(StepOutcome::Progress),
            SupplyOutcome::ChestEmpty => {
                self.status = AgentStatus::WaitingFuel;
                self.last_error = Some("chest_empty".to_string());
                Ok(StepOutcome::Waiting)
            }
        }
    }

    fn step_ore(&mut self, origin: Pos, block: &str) -> Result<StepOutcome> {
        self.status = AgentStatus::Working;

        // A stale vein from a previous job must not leak into this one.
        let stale = self
            .vein
            .as_ref()
            .map(|v| v.origin != origin || v.block != block)
            .unwrap_or(false);
        if stale {
            self.vein = None;
        }

        // A peer may have consumed this vein already.
        if self.state.ore.status(origin, block) == Some(OreStatus::Mined) && self.vein.is_none() {
            return Ok(StepOutcome::Done);
        }

        if self.vein.is_none() {
            self.vein = Some(ActiveVein {
                origin,
                block: block.to_string(),
                frontier: VecDeque::from([origin]),
                to_scan: VecDeque::new(),
                mined: 0,
            });
        }

        // Finish any pending in-place scans first: walk into the cleared
        // cell and look at its neighbours.
        let pending_scan = self
            .vein
            .as_ref()
            .and_then(|v| v.to_scan.front().copied());
        if let Some(cell) = pending_scan {
            if self.movement.pose().pos == cell {
                let sightings = self.scan_around()?;
                let vein = self.vein.as_mut().expect("vein active");
                vein.to_scan.pop_front();
                let vein_block = vein.block.clone();
                let mut grow = Vec::new();
                for (pos, seen_block) in sightings {
                    if seen_block == vein_block {
                        grow.push(pos);
                    }
                    self.state.ore.observe(pos, &seen_block);
                }
                let vein = self.vein.as_mut().expect("vein active");
                for pos in grow {
                    if !vein.frontier.contains(&pos) {
                        vein.frontier.push_back(pos);
                    }
                }
                self.store.save_state(&self.state)?;
            } else {
                self.nav_step(cell)?;
            }
            return Ok(StepOutcome::Progress);
        }

        let vein = self.vein.as_ref().expect("vein active");
        if vein.mined >= self.config.vein_cap || vein.frontier.is_empty() {
            debug!(
                agent = %self.id,
                mined = vein.mined,
                remaining = vein.frontier.len(),
                "Vein flood-fill finished"
            );
            self.vein = None;
            self.store.save_state(&self.state)?;
            return Ok(StepOutcome::Done);
        }
        let target = *vein.frontier.front().expect("frontier non-empty");
        let block_name = vein.block.clone();

        let pose = self.movement.pose();
        if pose.pos.manhattan(target) == 1 {
            // Adjacent: identify the block before touching it.
            let face = if target == pose.above() {
                Some(Face::Up)
            } else if target == pose.below() {
                Some(Face::Down)
            } else if target == pose.ahead() {
                Some(Face::Front)
            } else {
                None
            };
            let Some(face) = face else {
                // Horizontal neighbour we are not facing yet.
                let dir = Dir::toward_x(pose.pos, target)
                    .or_else(|| Dir::toward_z(pose.pos, target))
                    .expect("adjacent cell differs on one axis");
                self.face_step(dir)?;
                return Ok(StepOutcome::Progress);
            };
            match self.world.inspect(face) {
                Some(b) if b == block_name => {
                    self.movement.dig(
                        self.world.as_mut(),
                        &mut self.journal,
                        &self.store,
                        &mut self.state,
                        face,
                    )?;
                    self.state.ore.mark_mined(target, &block_name);
                    self.state.metrics.ore_blocks_mined += 1;
                    let vein = self.vein.as_mut().expect("vein active");
                    vein.mined += 1;
                    vein.frontier.pop_front();
                    vein.to_scan.push_back(target);
                    self.store.save_state(&self.state)?;
                }
                _ => {
                    // Gone: a peer got here first. Promote, no second dig.
                    self.state.ore.mark_mined(target, &block_name);
                    self.vein.as_mut().expect("vein active").frontier.pop_front();
                    self.store.save_state(&self.state)?;
                }
            }
            return Ok(StepOutcome::Progress);
        }

        self.nav_step(target)?;
        Ok(StepOutcome::Progress)
    }

    async fn step_tunnel(&mut self, tunnel_id: &TunnelId) -> Result<StepOutcome> {
        self.status = AgentStatus::Working;
        let Some(tunnel) = self.state.tunnels.get(tunnel_id).cloned() else {
            // Re-tiled out from under us by a config change; the work is moot.
            warn!(agent = %self.id, tunnel = %tunnel_id, "Tunnel no longer in the plan; dropping job");
            return Ok(StepOutcome::Done);
        };

        if tunnel.claimed_by != Some(self.id) {
            // Duplicate-claim reconciliation went against us.
            info!(agent = %self.id, tunnel = %tunnel_id, "Claim lost in reconciliation; abandoning");
            return Ok(StepOutcome::Done);
        }

        if tunnel.is_finished() {
            self.send_journalled(
                None,
                Message::JobRelease {
                    tunnel_id: tunnel_id.clone(),
                    progress: tunnel.progress,
                    state: TunnelState::Done,
                },
            )
            .await?;
            self.state
                .tunnels
                .release(tunnel_id, self.id, tunnel.progress, TunnelState::Done);
            self.state.metrics.tunnels_completed += 1;
            self.store.save_state(&self.state)?;
            return Ok(StepOutcome::Done);
        }

        let stand = if tunnel.progress == 0 {
            tunnel.origin
        } else {
            tunnel.working_cell()
        };
        if self.movement.pose().pos != stand {
            // Travel the reserved routes: out of any current corridor, the
            // column for vertical moves, then in along our own line.
            let own_line = {
                let pos = self.movement.pose().pos;
                pos.x == tunnel.origin.x && pos.y == tunnel.origin.y
            };
            if own_line {
                self.nav_step(stand)?;
            } else {
                self.corridor_step(Pos::new(tunnel.origin.x, tunnel.origin.y, 0))?;
            }
            return Ok(StepOutcome::Progress);
        }

        self.state.tunnels.activate(tunnel_id, self.id);

        if tunnel.progress == 0 {
            // Open the origin cell: make it 2 tall and take stock.
            self.movement.dig(
                self.world.as_mut(),
                &mut self.journal,
                &self.store,
                &mut self.state,
                Face::Up,
            )?;
            let sightings = self.scan_around()?;
            self.record_sightings(sightings)?;
            self.state.tunnels.record_progress(tunnel_id, 1);
            self.store.save_state(&self.state)?;
            return Ok(StepOutcome::Progress);
        }

        if !self.face_step(Dir::PosZ)? {
            return Ok(StepOutcome::Progress);
        }

        // One forward cycle: clear ahead, step in, clear the ceiling, scan.
        self.movement.dig(
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
            Face::Front,
        )?;
        self.movement.forward(
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
        )?;
        self.movement.dig(
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
            Face::Up,
        )?;
        let sightings = self.scan_around()?;
        self.record_sightings(sightings)?;
        self.state.tunnels.record_progress(tunnel_id, tunnel.progress + 1);
        self.store.save_state(&self.state)?;
        Ok(StepOutcome::Progress)
    }

    // ── shared helpers ──

    fn nav_step(&mut self, target: Pos) -> Result<NavStep> {
        navigator::step_toward(
            &mut self.movement,
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
            target,
        )
    }

    /// One step of corridor-disciplined travel toward a `z = 0` stand cell.
    fn corridor_step(&mut self, stand: Pos) -> Result<NavStep> {
        let waypoint = navigator::corridor_target(self.movement.pose().pos, stand);
        self.nav_step(waypoint)
    }

    /// One facing turn toward `dir`; true when already facing it.
    fn face_step(&mut self, dir: Dir) -> Result<bool> {
        navigator::face(
            &mut self.movement,
            self.world.as_mut(),
            &mut self.journal,
            &self.store,
            &mut self.state,
            dir,
        )
    }

    /// Inspect up, down, and all four horizontals (rotating in place), and
    /// report ore-tagged sightings with their positions. Facing is restored
    /// by the fourth turn.
    fn scan_around(&mut self) -> Result<Vec<(Pos, String)>> {
        let mut sightings = Vec::new();
        let pose = self.movement.pose();
        if let Some(block) = self.world.inspect(Face::Up) {
            if self.config.ore_tags.contains(&block) {
                sightings.push((pose.above(), block));
            }
        }
        if let Some(block) = self.world.inspect(Face::Down) {
            if self.config.ore_tags.contains(&block) {
                sightings.push((pose.below(), block));
            }
        }
        for _ in 0..4 {
            let pose = self.movement.pose();
            if let Some(block) = self.world.inspect(Face::Front) {
                if self.config.ore_tags.contains(&block) {
                    sightings.push((pose.ahead(), block));
                }
            }
            self.movement.turn_left(
                self.world.as_mut(),
                &mut self.journal,
                &self.store,
                &mut self.state,
            )?;
        }
        Ok(sightings)
    }

    fn record_sightings(&mut self, sightings: Vec<(Pos, String)>) -> Result<()> {
        for (pos, block) in sightings {
            if self.state.ore.observe(pos, &block) {
                self.queue
                    .enqueue(&self.store, JobKind::OreMine { pos, block })?;
            }
        }
        Ok(())
    }

    /// Broadcast wrapped in the journal: a crash between begin and the send
    /// re-sends on replay (receivers treat these messages idempotently).
    async fn send_journalled(&mut self, to: Option<AgentId>, message: Message) -> Result<()> {
        let id = self.journal.begin(
            &self.store,
            EffectKind::Broadcast,
            &BroadcastPayload {
                seq: self.bus.seq() + 1,
                to,
                message: message.clone(),
            },
        )?;
        self.bus.send(to, message).await?;
        self.journal.complete(&self.store, id)?;
        Ok(())
    }

    async fn heartbeat_if_due(&mut self) -> Result<()> {
        let due = self
            .last_heartbeat_tick
            .map(|t| self.tick.saturating_sub(t) >= self.config.heartbeat_interval_ticks)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        self.last_heartbeat_tick = Some(self.tick);
        let message = Message::Heartbeat {
            status: self.status,
            job: self.queue.active().map(|j| j.kind.label().to_string()),
            fuel: self.world.fuel_level(),
            config_version: self.config.config_version,
            tick: self.tick,
            last_error: self.last_error.take(),
        };
        self.bus.send(None, message).await?;
        Ok(())
    }
}

/// Journal replay: decide for each pending entry whether its effect took
/// place, observing the world or re-attempting idempotently.
struct ReplayVerifier<'a> {
    world: &'a mut dyn World,
    movement: &'a mut Movement,
    state: &'a mut PersistedState,
    store: &'a StateStore,
    outbox: &'a mut Vec<(Option<AgentId>, Message)>,
}

impl EffectVerifier for ReplayVerifier<'_> {
    fn verify(&mut self, entry: &EffectEntry) -> Result<bool> {
        match entry.kind {
            EffectKind::MoveForward
            | EffectKind::MoveBack
            | EffectKind::MoveUp
            | EffectKind::MoveDown => {
                let p: MovePayload = serde_json::from_value(entry.payload.clone())?;
                match self.world.locate() {
                    Some(actual) if actual.pos == p.to.pos => {
                        self.movement.adopt_pose(actual, self.store, self.state)?;
                        Ok(true)
                    }
                    Some(actual) if actual.pos == p.from.pos => {
                        // The move never happened; re-attempt it once.
                        let retried = match entry.kind {
                            EffectKind::MoveForward => self.world.forward(),
                            EffectKind::MoveBack => self.world.back(),
                            EffectKind::MoveUp => self.world.up(),
                            _ => self.world.down(),
                        };
                        if retried.is_ok() {
                            let now = self.world.locate().unwrap_or(p.to);
                            self.movement.adopt_pose(now, self.store, self.state)?;
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                    _ => Ok(false),
                }
            }
            EffectKind::TurnLeft | EffectKind::TurnRight => {
                let p: TurnPayload = serde_json::from_value(entry.payload.clone())?;
                match self.world.locate() {
                    Some(actual) if actual.dir == p.to_dir => {
                        self.movement.adopt_pose(actual, self.store, self.state)?;
                        Ok(true)
                    }
                    Some(actual) if actual.dir == p.from_dir => {
                        match entry.kind {
                            EffectKind::TurnLeft => self.world.turn_left(),
                            _ => self.world.turn_right(),
                        }
                        let now = self
                            .world
                            .locate()
                            .unwrap_or(Pose::new(actual.pos, p.to_dir));
                        self.movement.adopt_pose(now, self.store, self.state)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            EffectKind::DigForward | EffectKind::DigUp | EffectKind::DigDown => {
                let p: DigPayload = serde_json::from_value(entry.payload.clone())?;
                match self.world.locate() {
                    Some(actual) if actual.pos == p.at.pos => {
                        // A front dig is only meaningful while facing the
                        // same way the intent was issued.
                        if p.face == Face::Front && actual.dir != p.at.dir {
                            return Ok(false);
                        }
                        // Re-dig until the face is clear; digging is re-entrant.
                        if self.world.detect(p.face) {
                            self.world.dig(p.face);
                        }
                        Ok(!self.world.detect(p.face))
                    }
                    _ => Ok(false),
                }
            }
            EffectKind::ClaimTunnel => {
                let p: ClaimPayload = serde_json::from_value(entry.payload.clone())?;
                self.state.tunnels.merge_assignment(p.tunnel);
                self.store.save_state(self.state)?;
                Ok(true)
            }
            EffectKind::ReleaseTunnel => {
                let p: ReleasePayload = serde_json::from_value(entry.payload.clone())?;
                self.outbox.push((
                    None,
                    Message::JobRelease {
                        tunnel_id: p.tunnel_id,
                        progress: p.progress,
                        state: p.state,
                    },
                ));
                Ok(true)
            }
            // Chest rounds are re-entrant: the owning job re-runs them.
            EffectKind::Deposit | EffectKind::Refuel => Ok(true),
            EffectKind::Broadcast => {
                let p: BroadcastPayload = serde_json::from_value(entry.payload.clone())?;
                // Receivers handle these idempotently, so re-send.
                self.outbox.push((p.to, p.message));
                Ok(true)
            }
            // Calibration is idempotent; the preamble re-runs from scratch.
            EffectKind::Calibrate => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::bus::LoopbackHub;
    use crate::geometry::BoundingBox;
    use crate::movement::tests::GridWorld;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn test_config() -> QuarryConfig {
        QuarryConfig {
            quarry_id: "q-test".into(),
            bounds: BoundingBox::new(8, 6, 16),
            chunk_length: 4,
            fuel_reserve: 10,
            target_fuel: 100,
            ..QuarryConfig::default()
        }
    }

    /// Agent standing on solid ground at the spawn column, full of fuel.
    fn grounded_world() -> GridWorld {
        GridWorld::empty(Pose::new(Pos::ORIGIN, Dir::PosZ), 10_000)
            .with_block(Pos::new(0, -1, 0), "minecraft:stone")
    }

    fn spawn_worker(
        hub: &LoopbackHub,
        dir: &TempDir,
        id: u32,
        world: GridWorld,
    ) -> Worker {
        let config = test_config();
        let store =
            StateStore::open(dir.path().join(format!("agent-{id}")), &config.quarry_id).unwrap();
        let bus = AgentBus::Loopback(hub.endpoint(AgentId(id), &config.quarry_id));
        let mut worker =
            Worker::new(AgentId(id), config, Box::new(world), bus, store).unwrap();
        worker.set_recv_timeout(NO_WAIT);
        worker
    }

    #[tokio::test]
    async fn calibration_fixes_the_origin_in_one_tick() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let mut worker = spawn_worker(&hub, &dir, 1, grounded_world());

        worker.tick_once().await.unwrap();
        assert!(worker.state().calibrated);
        assert_eq!(worker.pose().pos, Pos::ORIGIN);
    }

    #[tokio::test]
    async fn lone_agent_self_assigns_the_first_tunnel() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let mut worker = spawn_worker(&hub, &dir, 1, grounded_world());

        for _ in 0..3 {
            worker.tick_once().await.unwrap();
        }
        assert_eq!(worker.leader_view(), AgentId(1));
        let claimed = worker.state().tunnels.claimed_by(AgentId(1)).unwrap();
        assert_eq!(claimed.origin, Pos::new(0, 0, 0));
        assert!(worker.active_job().is_some());
    }

    #[tokio::test]
    async fn pose_stays_inside_the_box_for_the_whole_run() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let mut worker = spawn_worker(&hub, &dir, 1, grounded_world());

        let bounds = worker.config().bounds;
        for _ in 0..60 {
            worker.tick_once().await.unwrap();
            if worker.state().calibrated {
                assert!(bounds.contains(worker.pose().pos), "pose {}", worker.pose());
            }
        }
    }

    #[tokio::test]
    async fn recall_broadcast_activates_a_priority_zero_job_within_a_tick() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let mut worker = spawn_worker(&hub, &dir, 1, grounded_world());
        let mut operator = hub.endpoint(AgentId(99), "q-test");

        // Let it calibrate and start working first.
        for _ in 0..5 {
            worker.tick_once().await.unwrap();
        }
        operator.send(None, Message::Recall { active: true });
        worker.tick_once().await.unwrap();
        worker.tick_once().await.unwrap();

        let active = worker.active_job().unwrap();
        assert_eq!(active.priority, 0);
        assert!(matches!(active.kind, JobKind::Recall));
        assert!(worker.state().recall);
    }

    #[tokio::test]
    async fn heartbeats_carry_status_and_config_version() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let mut observer = hub.endpoint(AgentId(99), "q-test");
        let mut worker = spawn_worker(&hub, &dir, 1, grounded_world());

        worker.tick_once().await.unwrap();
        let envelope = observer.recv(NO_WAIT).await.expect("heartbeat on first tick");
        match envelope.message {
            Message::Heartbeat { config_version, .. } => assert_eq!(config_version, 1),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn config_drift_triggers_a_request_and_halts_tunnel_work() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let mut worker = spawn_worker(&hub, &dir, 1, grounded_world());
        let mut peer = hub.endpoint(AgentId(2), "q-test");

        for _ in 0..3 {
            worker.tick_once().await.unwrap();
        }
        let progress_before = tunnel_progress(&worker);

        peer.send(
            None,
            Message::Heartbeat {
                status: AgentStatus::Working,
                job: None,
                fuel: 500,
                config_version: 7,
                tick: 3,
                last_error: None,
            },
        );
        worker.tick_once().await.unwrap();

        // The worker asked for the newer config...
        let mut saw_request = false;
        while let Some(envelope) = peer.recv(NO_WAIT).await {
            if envelope.message == Message::ConfigRequest {
                saw_request = true;
            }
        }
        assert!(saw_request);

        // ...and refuses destructive progress until it arrives.
        for _ in 0..5 {
            worker.tick_once().await.unwrap();
        }
        assert_eq!(tunnel_progress(&worker), progress_before);

        let newer = QuarryConfig {
            config_version: 7,
            ..test_config()
        };
        peer.send(None, Message::ConfigUpdate { config: newer });
        for _ in 0..4 {
            worker.tick_once().await.unwrap();
        }
        assert_eq!(worker.config().config_version, 7);
        assert!(tunnel_progress(&worker) >= progress_before);
    }

    #[tokio::test]
    async fn bounding_box_shrink_recalls_an_outside_agent() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let mut worker = spawn_worker(&hub, &dir, 1, grounded_world());
        let mut operator = hub.endpoint(AgentId(99), "q-test");

        // Work until the agent stands somewhere the shrunken box excludes.
        let shrunk_bounds = BoundingBox::new(1, 1, 1);
        let mut ticks = 0;
        while shrunk_bounds.contains(worker.pose().pos) {
            worker.tick_once().await.unwrap();
            ticks += 1;
            assert!(ticks < 200, "agent never left the shrink target");
        }

        let shrunk = QuarryConfig {
            config_version: 2,
            bounds: shrunk_bounds,
            ..test_config()
        };
        operator.send(None, Message::ConfigUpdate { config: shrunk });
        worker.tick_once().await.unwrap();

        assert!(worker.has_live_job("recall"));
        assert_eq!(worker.config().config_version, 2);
    }

    #[tokio::test]
    async fn replayed_move_entry_is_confirmed_against_the_world() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let store = StateStore::open(dir.path().join("agent-1"), &config.quarry_id).unwrap();

        // Hand-craft a crash: pose persisted at the origin, journal holding a
        // pending forward move that DID happen in the world.
        {
            let mut journal = Journal::default();
            let from = Pose::new(Pos::new(0, 0, 0), Dir::PosZ);
            let to = Pose::new(Pos::new(0, 0, 1), Dir::PosZ);
            journal
                .begin(&store, EffectKind::MoveForward, &MovePayload { from, to })
                .unwrap();
            let mut state = PersistedState::default();
            state.calibrated = true;
            state.pose = from;
            state.config_version = config.config_version;
            state.tunnels = TunnelPlan::generate(&config);
            store.save_state(&state).unwrap();
        }

        let world = GridWorld::empty(Pose::new(Pos::new(0, 0, 1), Dir::PosZ), 1_000)
            .with_block(Pos::new(0, -1, 0), "minecraft:stone");
        let bus = AgentBus::Loopback(hub.endpoint(AgentId(1), &config.quarry_id));
        let mut worker = Worker::new(AgentId(1), config, Box::new(world), bus, store).unwrap();
        worker.set_recv_timeout(NO_WAIT);

        worker.tick_once().await.unwrap();
        // Replay confirmed the move and adopted the real pose.
        assert_eq!(worker.pose().pos, Pos::new(0, 0, 1));
        assert_ne!(worker.status(), AgentStatus::Fault);
    }

    fn tunnel_progress(worker: &Worker) -> u32 {
        worker
            .state()
            .tunnels
            .tunnels
            .values()
            .map(|t| t.progress)
            .sum()
    }
}
