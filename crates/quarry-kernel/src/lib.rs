//! Quarry kernel: distributed coordination and persistent execution for
//! cooperative mining fleets.
//!
//! One [`Worker`] per agent runs a serial tick loop over a quarry-scoped
//! broadcast bus. Everything non-idempotent the agent does is wrapped in the
//! [`journal`]: intent persists before the native action, and replay
//! verifiers decide after a crash whether the effect took place. The shared
//! tunnel plan is a per-agent replica with the acting leader (lowest live
//! id) as the authoritative writer for claim transitions.
//!
//! ## Quick start
//!
//! ```ignore
//! use quarry_kernel::{AgentBus, AgentId, LoopbackHub, QuarryConfig, StateStore, Worker};
//!
//! let config = QuarryConfig::default();
//! let hub = LoopbackHub::new();
//! let store = StateStore::open("./data/agent-1", &config.quarry_id)?;
//! let bus = AgentBus::Loopback(hub.endpoint(AgentId(1), &config.quarry_id));
//!
//! // `world` implements quarry_kernel::World (the automine binary ships a
//! // simulated one).
//! let mut worker = Worker::new(AgentId(1), config, world, bus, store)?;
//! worker.run(10_000, &stop_flag).await?;
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod geometry;
pub mod jobs;
pub mod journal;
pub mod membership;
pub mod messages;
pub mod movement;
pub mod navigator;
pub mod ore;
pub mod plan;
pub mod store;
pub mod supply;
pub mod udp;
pub mod worker;
pub mod world;

pub use bus::{AgentBus, LoopbackBus, LoopbackHub};
pub use config::QuarryConfig;
pub use error::{MineError, Result};
pub use geometry::{BoundingBox, Dir, Pos, Pose};
pub use jobs::{Job, JobKind, JobQueue, JobStatus};
pub use journal::{EffectKind, EffectVerifier, Journal};
pub use membership::Membership;
pub use messages::{AgentId, AgentStatus, Envelope, Message, PROTOCOL};
pub use movement::Movement;
pub use ore::{OreRegistry, OreStatus};
pub use plan::{Tunnel, TunnelId, TunnelPlan, TunnelState};
pub use store::{Metrics, PersistedState, StateStore};
pub use udp::{UdpBus, OPERATOR_ID};
pub use worker::Worker;
pub use world::{Face, ItemStack, MoveDenied, World, AGENT_BLOCK, SLOT_COUNT};
