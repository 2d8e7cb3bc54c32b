//! Quarry configuration.
//!
//! One configuration per quarry, created interactively on the first boot of
//! any agent and fetched over the bus by everyone else. Any change bumps the
//! monotonic `config_version`; peers observing a higher version in a
//! heartbeat request and apply the new blob before running destructive jobs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{MineError, Result};
use crate::geometry::{BoundingBox, Dir, Pos};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarryConfig {
    /// Opaque quarry identifier; scopes the bus protocol and on-disk files.
    pub quarry_id: String,

    /// Monotonic version; advanced on every change.
    pub config_version: u64,

    /// The region agents may enter.
    pub bounds: BoundingBox,

    /// Horizontal gap between tunnel origins on a layer. Must be >= 3 to
    /// preserve the two-cell air wall between corridors.
    pub tunnel_spacing: u32,

    /// Vertical gap between layers. Must be >= 3.
    pub layer_spacing: u32,

    /// Tunnel length along +z, clipped to the bounding box.
    pub chunk_length: u32,

    /// Below this fuel level the agent escalates a refuel job.
    pub fuel_reserve: u64,

    /// Refuelling continues until this level is reached.
    pub target_fuel: u64,

    /// Extra fuel demanded on top of job cost + return distance.
    pub safety_margin: u64,

    /// Fuel items retained per deposit for autonomy.
    pub keep_fuel_items: u32,

    /// Facing assumed at the spawn column; the chests sit behind it.
    pub spawn_facing: Dir,

    /// Cell of the fuel chest (bottom-most, behind spawn).
    pub fuel_chest_offset: Pos,

    /// Cell of the deposit chest.
    pub deposit_offset: Pos,

    /// Cell where a recalled agent parks if the column is full.
    pub rest_offset: Pos,

    /// Item names accepted as fuel.
    pub allowed_fuel: BTreeSet<String>,

    /// Block names recorded as ore during scanning.
    pub ore_tags: BTreeSet<String>,

    /// Ticks between heartbeats.
    pub heartbeat_interval_ticks: u64,

    /// Ticks of silence after which a peer is declared dead. Liveness is
    /// counted in local ticks, not wall-clock, so paused servers do not
    /// falsely expire peers.
    pub heartbeat_timeout_ticks: u64,

    /// Failures before a job is dropped.
    pub max_job_failures: u32,

    /// Dig/attack attempts before a movement step reports `Blocked`.
    pub clear_retry_limit: u32,

    /// Maximum blocks mined by one vein flood-fill.
    pub vein_cap: u32,

    /// Cells climbed per calibration backoff when stacked on another agent.
    pub max_climb: u32,
}

impl Default for QuarryConfig {
    fn default() -> Self {
        Self {
            quarry_id: "default".to_string(),
            config_version: 1,
            bounds: BoundingBox::default(),
            tunnel_spacing: 3,
            layer_spacing: 3,
            chunk_length: 16,
            fuel_reserve: 100,
            target_fuel: 1000,
            safety_margin: 20,
            keep_fuel_items: 8,
            spawn_facing: Dir::PosZ,
            fuel_chest_offset: Pos::new(0, 0, -1),
            deposit_offset: Pos::new(0, 1, -1),
            rest_offset: Pos::new(0, 2, -1),
            allowed_fuel: ["minecraft:coal", "minecraft:charcoal", "minecraft:coal_block"]
                .into_iter()
                .map(String::from)
                .collect(),
            ore_tags: [
                "minecraft:coal_ore",
                "minecraft:iron_ore",
                "minecraft:gold_ore",
                "minecraft:diamond_ore",
                "minecraft:redstone_ore",
                "minecraft:lapis_ore",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            heartbeat_interval_ticks: 4,
            heartbeat_timeout_ticks: 20,
            max_job_failures: 3,
            clear_retry_limit: 8,
            vein_cap: 32,
            max_climb: 4,
        }
    }
}

impl QuarryConfig {
    /// Reject configurations that would violate the tunnel spacing invariant
    /// or describe an empty quarry.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel_spacing < 3 {
            return Err(MineError::InvalidConfig(format!(
                "tunnel_spacing {} breaks the two-cell air wall (minimum 3)",
                self.tunnel_spacing
            )));
        }
        if self.layer_spacing < 3 {
            return Err(MineError::InvalidConfig(format!(
                "layer_spacing {} breaks the two-cell air wall (minimum 3)",
                self.layer_spacing
            )));
        }
        if self.chunk_length == 0 {
            return Err(MineError::InvalidConfig("chunk_length must be > 0".into()));
        }
        if self.quarry_id.is_empty() {
            return Err(MineError::InvalidConfig("quarry_id must be non-empty".into()));
        }
        Ok(())
    }

    /// Cell an agent stands in to face the given chest. The chest sits one
    /// step behind the column, so the stand cell is the chest cell pushed
    /// back toward spawn.
    pub fn chest_stand(&self, chest: Pos) -> Pos {
        let d = self.spawn_facing.step();
        chest.offset(d.x, d.y, d.z)
    }

    /// Facing used when interacting with the chests (opposite of spawn
    /// facing).
    pub fn chest_facing(&self) -> Dir {
        self.spawn_facing.opposite()
    }
}
