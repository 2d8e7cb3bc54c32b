//! Simulated voxel world.
//!
//! One shared [`SimWorld`] per quarry; each agent holds a [`SimHandle`]
//! implementing the kernel's `World` trait. The simulation tracks ground
//! truth: solid blocks, chest contents, and each agent's body (pose, fuel,
//! inventory). Agents collide with blocks, chests, and each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use quarry_kernel::{
    AgentId, Dir, Face, ItemStack, MoveDenied, Pos, Pose, QuarryConfig, World, AGENT_BLOCK,
    SLOT_COUNT,
};

const STONE: &str = "minecraft:stone";
const CHEST: &str = "minecraft:chest";
const FUEL_ITEM: &str = "minecraft:coal";

/// Knobs for world generation.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub seed: u64,
    pub initial_fuel: u64,
    /// Ore veins scattered through the rock.
    pub ore_veins: usize,
    /// Coal stacks waiting in the fuel chest.
    pub chest_fuel_stacks: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            initial_fuel: 10_000,
            ore_veins: 0,
            chest_fuel_stacks: 64,
        }
    }
}

#[derive(Debug)]
struct AgentBody {
    pose: Pose,
    fuel: u64,
    inventory: Vec<Option<ItemStack>>,
}

#[derive(Debug, Default)]
struct SimState {
    blocks: HashMap<Pos, String>,
    chests: HashMap<Pos, Vec<ItemStack>>,
    agents: HashMap<AgentId, AgentBody>,
}

impl SimState {
    fn agent_at(&self, pos: Pos) -> Option<AgentId> {
        self.agents
            .iter()
            .find(|(_, body)| body.pose.pos == pos)
            .map(|(&id, _)| id)
    }

    fn occupied(&self, pos: Pos) -> bool {
        self.blocks.contains_key(&pos)
            || self.chests.contains_key(&pos)
            || self.agent_at(pos).is_some()
    }

    fn name_at(&self, pos: Pos) -> Option<String> {
        if let Some(block) = self.blocks.get(&pos) {
            return Some(block.clone());
        }
        if self.chests.contains_key(&pos) {
            return Some(CHEST.to_string());
        }
        self.agent_at(pos).map(|_| AGENT_BLOCK.to_string())
    }

    fn stash(&mut self, id: AgentId, item: &str) {
        let body = self.agents.get_mut(&id).expect("known agent");
        for slot in body.inventory.iter_mut().flatten() {
            if slot.item == item && slot.count < 64 {
                slot.count += 1;
                return;
            }
        }
        if let Some(empty) = body.inventory.iter_mut().find(|s| s.is_none()) {
            *empty = Some(ItemStack::new(item, 1));
        }
        // A full inventory spills the drop; the simulation discards it.
    }
}

/// The shared quarry world.
#[derive(Debug, Clone)]
pub struct SimWorld {
    inner: Arc<Mutex<SimState>>,
    initial_fuel: u64,
}

impl SimWorld {
    /// Fill the bounding box with rock (leaving the spawn column open),
    /// place the chests behind the column, and scatter ore.
    pub fn build(config: &QuarryConfig, sim: &SimConfig) -> Self {
        let mut state = SimState::default();
        let b = config.bounds;
        for x in 0..=b.max_x {
            for y in 0..=b.max_y {
                for z in 0..=b.max_z {
                    if x == 0 && z == 0 {
                        continue; // spawn column stays open
                    }
                    state.blocks.insert(Pos::new(x, y, z), STONE.to_string());
                }
            }
        }
        // Bedrock floor under the whole box so calibration always grounds.
        for x in -1..=b.max_x {
            for z in -1..=b.max_z {
                state
                    .blocks
                    .insert(Pos::new(x, -1, z), "minecraft:bedrock".to_string());
            }
        }

        let fuel: Vec<ItemStack> = (0..sim.chest_fuel_stacks)
            .map(|_| ItemStack::new(FUEL_ITEM, 64))
            .collect();
        state.chests.insert(config.fuel_chest_offset, fuel);
        state.chests.insert(config.deposit_offset, Vec::new());

        let mut rng = StdRng::seed_from_u64(sim.seed);
        let ores = [
            "minecraft:coal_ore",
            "minecraft:iron_ore",
            "minecraft:gold_ore",
            "minecraft:diamond_ore",
        ];
        for _ in 0..sim.ore_veins {
            let seed = Pos::new(
                rng.gen_range(1..=b.max_x),
                rng.gen_range(0..=b.max_y),
                rng.gen_range(1..=b.max_z),
            );
            if seed.x == 0 && seed.z == 0 {
                continue;
            }
            let ore = ores[rng.gen_range(0..ores.len())];
            let size = rng.gen_range(1..=3);
            let mut cell = seed;
            for _ in 0..size {
                // Only replace rock; never bedrock, chests, or open cells.
                if cell.y >= 0 && state.blocks.get(&cell).map(String::as_str) == Some(STONE) {
                    state.blocks.insert(cell, ore.to_string());
                }
                let neighbours = cell.neighbours();
                cell = neighbours[rng.gen_range(0..neighbours.len())];
            }
        }

        debug!(
            blocks = state.blocks.len(),
            veins = sim.ore_veins,
            "Simulated world built"
        );
        Self {
            inner: Arc::new(Mutex::new(state)),
            initial_fuel: sim.initial_fuel,
        }
    }

    /// Register an agent stacked on the spawn column (`join_index` cells up)
    /// and hand back its world view.
    pub fn add_agent(&self, id: AgentId, join_index: i32, facing: Dir) -> SimHandle {
        let body = AgentBody {
            pose: Pose::new(Pos::new(0, join_index, 0), facing),
            fuel: self.initial_fuel,
            inventory: vec![None; SLOT_COUNT],
        };
        self.inner.lock().agents.insert(id, body);
        SimHandle {
            shared: self.inner.clone(),
            id,
        }
    }

    /// Re-attach to an agent body that already exists, e.g. a worker process
    /// restarting after a crash.
    pub fn handle(&self, id: AgentId) -> SimHandle {
        debug_assert!(self.inner.lock().agents.contains_key(&id));
        SimHandle {
            shared: self.inner.clone(),
            id,
        }
    }

    // ── test and report helpers ──

    pub fn block_at(&self, pos: Pos) -> Option<String> {
        self.inner.lock().blocks.get(&pos).cloned()
    }

    pub fn place_block(&self, pos: Pos, block: &str) {
        self.inner.lock().blocks.insert(pos, block.to_string());
    }

    pub fn count_blocks_named(&self, block: &str) -> usize {
        self.inner
            .lock()
            .blocks
            .values()
            .filter(|b| b.as_str() == block)
            .count()
    }

    pub fn chest_contents(&self, pos: Pos) -> Vec<ItemStack> {
        self.inner
            .lock()
            .chests
            .get(&pos)
            .cloned()
            .unwrap_or_default()
    }

    pub fn agent_pose(&self, id: AgentId) -> Option<Pose> {
        self.inner.lock().agents.get(&id).map(|b| b.pose)
    }

    pub fn agent_fuel(&self, id: AgentId) -> Option<u64> {
        self.inner.lock().agents.get(&id).map(|b| b.fuel)
    }
}

/// One agent's view of the shared world.
#[derive(Debug)]
pub struct SimHandle {
    shared: Arc<Mutex<SimState>>,
    id: AgentId,
}

impl SimHandle {
    fn face_cell(state: &SimState, id: AgentId, face: Face) -> Pos {
        let pose = state.agents[&id].pose;
        match face {
            Face::Front => pose.ahead(),
            Face::Up => pose.above(),
            Face::Down => pose.below(),
        }
    }

    fn try_move(&mut self, target_of: impl Fn(Pose) -> Pos) -> Result<(), MoveDenied> {
        let mut state = self.shared.lock();
        let body = &state.agents[&self.id];
        if body.fuel == 0 {
            return Err(MoveDenied::NoFuel);
        }
        let target = target_of(body.pose);
        if state.occupied(target) {
            return Err(MoveDenied::Obstructed);
        }
        let body = state.agents.get_mut(&self.id).expect("known agent");
        body.pose.pos = target;
        body.fuel -= 1;
        Ok(())
    }
}

impl World for SimHandle {
    fn forward(&mut self) -> Result<(), MoveDenied> {
        self.try_move(|pose| pose.ahead())
    }

    fn back(&mut self) -> Result<(), MoveDenied> {
        self.try_move(|pose| {
            let d = pose.dir.opposite().step();
            pose.pos.offset(d.x, d.y, d.z)
        })
    }

    fn up(&mut self) -> Result<(), MoveDenied> {
        self.try_move(|pose| pose.above())
    }

    fn down(&mut self) -> Result<(), MoveDenied> {
        self.try_move(|pose| pose.below())
    }

    fn turn_left(&mut self) {
        let mut state = self.shared.lock();
        let body = state.agents.get_mut(&self.id).expect("known agent");
        body.pose.dir = body.pose.dir.left();
    }

    fn turn_right(&mut self) {
        let mut state = self.shared.lock();
        let body = state.agents.get_mut(&self.id).expect("known agent");
        body.pose.dir = body.pose.dir.right();
    }

    fn detect(&self, face: Face) -> bool {
        let state = self.shared.lock();
        let cell = Self::face_cell(&state, self.id, face);
        state.occupied(cell)
    }

    fn inspect(&self, face: Face) -> Option<String> {
        let state = self.shared.lock();
        let cell = Self::face_cell(&state, self.id, face);
        state.name_at(cell)
    }

    fn dig(&mut self, face: Face) -> bool {
        let mut state = self.shared.lock();
        let cell = Self::face_cell(&state, self.id, face);
        match state.blocks.remove(&cell) {
            Some(block) => {
                if block != "minecraft:bedrock" {
                    state.stash(self.id, &block);
                    true
                } else {
                    // Bedrock is indestructible.
                    state.blocks.insert(cell, block);
                    false
                }
            }
            None => false,
        }
    }

    fn attack(&mut self, _face: Face) -> bool {
        false
    }

    fn fuel_level(&self) -> u64 {
        self.shared.lock().agents[&self.id].fuel
    }

    fn refuel(&mut self, slot: usize) -> u64 {
        let mut state = self.shared.lock();
        let body = state.agents.get_mut(&self.id).expect("known agent");
        let Some(stack) = body.inventory[slot].take() else {
            return 0;
        };
        match quarry_kernel::world::fuel_value(&stack.item) {
            Some(per_item) => {
                let gained = per_item * u64::from(stack.count);
                body.fuel += gained;
                gained
            }
            None => {
                body.inventory[slot] = Some(stack);
                0
            }
        }
    }

    fn suck(&mut self) -> bool {
        let mut state = self.shared.lock();
        let front = Self::face_cell(&state, self.id, Face::Front);
        let Some(stack) = state.chests.get_mut(&front).and_then(|c| c.pop()) else {
            return false;
        };
        let body = state.agents.get_mut(&self.id).expect("known agent");
        match body.inventory.iter_mut().find(|s| s.is_none()) {
            Some(empty) => {
                *empty = Some(stack);
                true
            }
            None => {
                // No room: put it back.
                state
                    .chests
                    .get_mut(&front)
                    .expect("chest present")
                    .push(stack);
                false
            }
        }
    }

    fn drop_items(&mut self, slot: usize, count: u32) -> u32 {
        let mut state = self.shared.lock();
        let front = Self::face_cell(&state, self.id, Face::Front);
        if !state.chests.contains_key(&front) {
            return 0;
        }
        let body = state.agents.get_mut(&self.id).expect("known agent");
        let Some(mut stack) = body.inventory[slot].take() else {
            return 0;
        };
        let dropped = stack.count.min(count);
        let item = stack.item.clone();
        stack.count -= dropped;
        if stack.count > 0 {
            body.inventory[slot] = Some(stack);
        }
        state
            .chests
            .get_mut(&front)
            .expect("chest present")
            .push(ItemStack::new(item, dropped));
        dropped
    }

    fn slot(&self, slot: usize) -> Option<ItemStack> {
        self.shared.lock().agents[&self.id].inventory[slot].clone()
    }

    fn locate(&self) -> Option<Pose> {
        Some(self.shared.lock().agents[&self.id].pose)
    }
}
