//! World trait: the seam for native robot actions.
//!
//! The kernel is world-agnostic; everything a robot can physically do is
//! behind this trait. The operator binary provides a simulated voxel world,
//! and unit tests use small in-memory stubs.

use serde::{Deserialize, Serialize};

use crate::geometry::{Pos, Pose};

/// Number of inventory slots on an agent.
pub const SLOT_COUNT: usize = 16;

/// Block name reported when another agent occupies the inspected cell.
/// Calibration uses this to tell a stacked agent apart from the quarry
/// floor.
pub const AGENT_BLOCK: &str = "automine:agent";

/// A stack of identical items in one inventory slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: String,
    pub count: u32,
}

impl ItemStack {
    pub fn new(item: impl Into<String>, count: u32) -> Self {
        Self {
            item: item.into(),
            count,
        }
    }
}

/// A face the robot can act on without moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Face {
    Front,
    Up,
    Down,
}

/// Why a native move primitive refused to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDenied {
    /// A block or another agent occupies the target cell.
    Obstructed,
    /// Fuel level is zero.
    NoFuel,
}

/// Native robot actions. All methods are synchronous and bounded.
///
/// Implementations track the robot's ground-truth pose; the kernel keeps its
/// own dead-reckoned [`Pose`] and reconciles the two through [`World::locate`]
/// during journal replay.
pub trait World: Send {
    /// Step one cell in the facing direction.
    fn forward(&mut self) -> Result<(), MoveDenied>;

    /// Step one cell backward without turning.
    fn back(&mut self) -> Result<(), MoveDenied>;

    fn up(&mut self) -> Result<(), MoveDenied>;

    fn down(&mut self) -> Result<(), MoveDenied>;

    fn turn_left(&mut self);

    fn turn_right(&mut self);

    /// Whether a solid block (or agent) occupies the cell at `face`.
    fn detect(&self, face: Face) -> bool;

    /// Block name at `face`, if any.
    fn inspect(&self, face: Face) -> Option<String>;

    /// Remove the block at `face`, collecting its drop into the inventory.
    /// Returns true if a block was removed.
    fn dig(&mut self, face: Face) -> bool;

    /// Swing at `face` (dislodges entities blocking a move). Returns true if
    /// something was hit.
    fn attack(&mut self, face: Face) -> bool;

    fn fuel_level(&self) -> u64;

    /// Consume the stack in `slot` as fuel. Returns fuel gained (0 if the
    /// slot is empty or not a fuel item).
    fn refuel(&mut self, slot: usize) -> u64;

    /// Pull one stack from the container in front into the inventory.
    /// Returns false if there is no container or it is empty.
    fn suck(&mut self) -> bool;

    /// Drop up to `count` items from `slot` into the container in front.
    /// Returns the number of items actually dropped.
    fn drop_items(&mut self, slot: usize, count: u32) -> u32;

    /// Inventory slot contents.
    fn slot(&self, slot: usize) -> Option<ItemStack>;

    /// Ground-truth pose, when localization is available. Journal verifiers
    /// rely on this to decide whether a crashed move actually happened.
    fn locate(&self) -> Option<Pose>;
}

/// Fuel yield for the common fuel items, mirroring furnace burn values.
pub fn fuel_value(item: &str) -> Option<u64> {
    match item {
        "minecraft:coal" | "minecraft:charcoal" => Some(80),
        "minecraft:coal_block" => Some(800),
        "minecraft:lava_bucket" => Some(1000),
        "minecraft:blaze_rod" => Some(120),
        "minecraft:stick" => Some(5),
        _ => None,
    }
}
