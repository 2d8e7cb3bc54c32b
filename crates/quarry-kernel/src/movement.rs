//! Movement: single-step motion gated by the bounding box, fuel, and the
//! journal.
//!
//! Every primitive journals its intent before touching the world and
//! persists the new pose before completing the entry, so a crash at any
//! point leaves either "intent pending, old pose" or "no intent, new pose"
//! on disk. Obstructions are cleared with a bounded detect -> dig -> attack
//! loop.

use tracing::{debug, trace};

use crate::error::{MineError, Result};
use crate::geometry::{BoundingBox, Dir, Pos, Pose};
use crate::journal::{DigPayload, EffectKind, Journal, MovePayload, TurnPayload};
use crate::store::{PersistedState, StateStore};
use crate::world::{Face, MoveDenied, World};

/// The pose tracker and motion gate for one agent.
#[derive(Debug)]
pub struct Movement {
    pose: Pose,
    bounds: BoundingBox,
    /// Containment is enforced only after calibration; the descent preamble
    /// is the single legal excursion.
    engaged: bool,
    clear_retry_limit: u32,
}

impl Movement {
    pub fn new(pose: Pose, bounds: BoundingBox, clear_retry_limit: u32) -> Self {
        Self {
            pose,
            bounds,
            engaged: false,
            clear_retry_limit,
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Arm the containment predicate once calibration has fixed the origin.
    pub fn engage_bounds(&mut self) {
        self.engaged = true;
    }

    /// Swap in a new box on configuration change.
    pub fn set_bounds(&mut self, bounds: BoundingBox) {
        self.bounds = bounds;
    }

    pub fn in_bounds(&self) -> bool {
        self.bounds.contains(self.pose.pos)
    }

    /// Adopt a pose established by journal replay or calibration.
    pub fn adopt_pose(
        &mut self,
        pose: Pose,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        self.pose = pose;
        self.commit(store, state)
    }

    fn commit(&self, store: &StateStore, state: &mut PersistedState) -> Result<()> {
        state.pose = self.pose;
        store.save_state(state)
    }

    fn guard(&self, target: Pos) -> Result<()> {
        if !self.engaged || self.bounds.contains(target) {
            return Ok(());
        }
        // Stranded outside (the box shrank under us): movement stays legal
        // so recall can walk the agent home.
        if !self.bounds.contains(self.pose.pos) {
            return Ok(());
        }
        Err(MineError::OutOfBounds(target))
    }

    fn guard_fuel(&self, world: &dyn World) -> Result<()> {
        let level = world.fuel_level();
        if level == 0 {
            return Err(MineError::FuelExhausted { level, needed: 1 });
        }
        Ok(())
    }

    fn translate(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
        kind: EffectKind,
        target: Pos,
        clear_face: Option<Face>,
        native: fn(&mut dyn World) -> std::result::Result<(), MoveDenied>,
    ) -> Result<()> {
        self.guard(target)?;
        self.guard_fuel(world)?;
        let to = Pose::new(target, self.pose.dir);
        let id = journal.begin(
            store,
            kind,
            &MovePayload {
                from: self.pose,
                to,
            },
        )?;

        let mut attempts = 0;
        loop {
            match native(world) {
                Ok(()) => break,
                Err(MoveDenied::NoFuel) => {
                    journal.abort(store, id)?;
                    return Err(MineError::FuelExhausted {
                        level: world.fuel_level(),
                        needed: 1,
                    });
                }
                Err(MoveDenied::Obstructed) => {
                    attempts += 1;
                    if attempts >= self.clear_retry_limit {
                        journal.abort(store, id)?;
                        return Err(MineError::Blocked { attempts });
                    }
                    if let Some(face) = clear_face {
                        if world.detect(face) {
                            if world.dig(face) {
                                state.metrics.blocks_mined += 1;
                            }
                        } else {
                            world.attack(face);
                        }
                    }
                    trace!(kind = %kind, attempts = attempts, "Clearing obstruction");
                }
            }
        }

        self.pose = to;
        state.metrics.steps += 1;
        self.commit(store, state)?;
        journal.complete(store, id)?;
        debug!(pose = %self.pose, kind = %kind, "Step");
        Ok(())
    }

    pub fn forward(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        self.translate(
            world,
            journal,
            store,
            state,
            EffectKind::MoveForward,
            self.pose.ahead(),
            Some(Face::Front),
            |w| w.forward(),
        )
    }

    /// Step backward. The robot cannot dig or swing behind itself, so the
    /// retry loop only waits out transient blockers.
    pub fn back(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        let d = self.pose.dir.opposite().step();
        let target = self.pose.pos.offset(d.x, d.y, d.z);
        self.translate(
            world,
            journal,
            store,
            state,
            EffectKind::MoveBack,
            target,
            None,
            |w| w.back(),
        )
    }

    pub fn up(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        self.translate(
            world,
            journal,
            store,
            state,
            EffectKind::MoveUp,
            self.pose.above(),
            Some(Face::Up),
            |w| w.up(),
        )
    }

    pub fn down(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        self.translate(
            world,
            journal,
            store,
            state,
            EffectKind::MoveDown,
            self.pose.below(),
            Some(Face::Down),
            |w| w.down(),
        )
    }

    /// Descend without clearing. Calibration probes for the floor with this:
    /// `Blocked` means floor or a stacked agent, never a dug-out crater.
    pub fn descend(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        self.translate(
            world,
            journal,
            store,
            state,
            EffectKind::MoveDown,
            self.pose.below(),
            None,
            |w| w.down(),
        )
    }

    fn rotate(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
        kind: EffectKind,
        to_dir: Dir,
    ) -> Result<()> {
        let id = journal.begin(
            store,
            kind,
            &TurnPayload {
                from_dir: self.pose.dir,
                to_dir,
            },
        )?;
        match kind {
            EffectKind::TurnLeft => world.turn_left(),
            _ => world.turn_right(),
        }
        self.pose.dir = to_dir;
        self.commit(store, state)?;
        journal.complete(store, id)?;
        Ok(())
    }

    pub fn turn_left(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        self.rotate(
            world,
            journal,
            store,
            state,
            EffectKind::TurnLeft,
            self.pose.dir.left(),
        )
    }

    pub fn turn_right(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
    ) -> Result<()> {
        self.rotate(
            world,
            journal,
            store,
            state,
            EffectKind::TurnRight,
            self.pose.dir.right(),
        )
    }

    /// Clear the cell at `face`, re-digging while falling blocks refill it.
    /// Returns the number of blocks removed.
    pub fn dig(
        &mut self,
        world: &mut dyn World,
        journal: &mut Journal,
        store: &StateStore,
        state: &mut PersistedState,
        face: Face,
    ) -> Result<u32> {
        let kind = match face {
            Face::Front => EffectKind::DigForward,
            Face::Up => EffectKind::DigUp,
            Face::Down => EffectKind::DigDown,
        };
        let id = journal.begin(
            store,
            kind,
            &DigPayload {
                at: self.pose,
                face,
            },
        )?;
        let mut dug = 0;
        let mut attempts = 0;
        while world.detect(face) {
            attempts += 1;
            if attempts > self.clear_retry_limit {
                journal.abort(store, id)?;
                return Err(MineError::Blocked { attempts });
            }
            if world.dig(face) {
                dug += 1;
            } else {
                world.attack(face);
            }
        }
        state.metrics.blocks_mined += u64::from(dug);
        self.commit(store, state)?;
        journal.complete(store, id)?;
        Ok(dug)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tempfile::TempDir;

    use crate::world::ItemStack;

    /// Minimal in-memory world for unit tests: a set of solid blocks and one
    /// robot with fuel.
    pub(crate) struct GridWorld {
        pub blocks: HashMap<Pos, String>,
        pub pose: Pose,
        pub fuel: u64,
        pub dug: HashSet<Pos>,
    }

    impl GridWorld {
        pub fn empty(pose: Pose, fuel: u64) -> Self {
            Self {
                blocks: HashMap::new(),
                pose,
                fuel,
                dug: HashSet::new(),
            }
        }

        pub fn with_block(mut self, pos: Pos, block: &str) -> Self {
            self.blocks.insert(pos, block.to_string());
            self
        }

        fn face_cell(&self, face: Face) -> Pos {
            match face {
                Face::Front => self.pose.ahead(),
                Face::Up => self.pose.above(),
                Face::Down => self.pose.below(),
            }
        }

        fn try_move(&mut self, target: Pos) -> std::result::Result<(), MoveDenied> {
            if self.fuel == 0 {
                return Err(MoveDenied::NoFuel);
            }
            if self.blocks.contains_key(&target) {
                return Err(MoveDenied::Obstructed);
            }
            self.fuel -= 1;
            self.pose.pos = target;
            Ok(())
        }
    }

    impl World for GridWorld {
        fn forward(&mut self) -> std::result::Result<(), MoveDenied> {
            self.try_move(self.pose.ahead())
        }

        fn back(&mut self) -> std::result::Result<(), MoveDenied> {
            let d = self.pose.dir.opposite().step();
            self.try_move(self.pose.pos.offset(d.x, d.y, d.z))
        }

        fn up(&mut self) -> std::result::Result<(), MoveDenied> {
            self.try_move(self.pose.above())
        }

        fn down(&mut self) -> std::result::Result<(), MoveDenied> {
            self.try_move(self.pose.below())
        }

        fn turn_left(&mut self) {
            self.pose.dir = self.pose.dir.left();
        }

        fn turn_right(&mut self) {
            self.pose.dir = self.pose.dir.right();
        }

        fn detect(&self, face: Face) -> bool {
            self.blocks.contains_key(&self.face_cell(face))
        }

        fn inspect(&self, face: Face) -> Option<String> {
            self.blocks.get(&self.face_cell(face)).cloned()
        }

        fn dig(&mut self, face: Face) -> bool {
            let cell = self.face_cell(face);
            if self.blocks.remove(&cell).is_some() {
                self.dug.insert(cell);
                true
            } else {
                false
            }
        }

        fn attack(&mut self, _face: Face) -> bool {
            false
        }

        fn fuel_level(&self) -> u64 {
            self.fuel
        }

        fn refuel(&mut self, _slot: usize) -> u64 {
            0
        }

        fn suck(&mut self) -> bool {
            false
        }

        fn drop_items(&mut self, _slot: usize, _count: u32) -> u32 {
            0
        }

        fn slot(&self, _slot: usize) -> Option<ItemStack> {
            None
        }

        fn locate(&self) -> Option<Pose> {
            Some(self.pose)
        }
    }

    pub(crate) fn rig() -> (TempDir, StateStore, Journal, PersistedState) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), "q-test").unwrap();
        let journal = Journal::default();
        let state = PersistedState::default();
        (dir, store, journal, state)
    }

    fn engaged_movement(pose: Pose) -> Movement {
        let mut movement = Movement::new(pose, BoundingBox::new(8, 6, 16), 4);
        movement.engage_bounds();
        movement
    }

    #[test]
    fn forward_updates_and_persists_the_pose() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(1, 0, 1), Dir::PosZ);
        let mut world = GridWorld::empty(start, 10);
        let mut movement = engaged_movement(start);

        movement
            .forward(&mut world, &mut journal, &store, &mut state)
            .unwrap();
        assert_eq!(movement.pose().pos, Pos::new(1, 0, 2));
        assert!(journal.is_empty());

        let persisted = store.load_state().unwrap().unwrap();
        assert_eq!(persisted.pose, movement.pose());
        assert_eq!(persisted.metrics.steps, 1);
    }

    #[test]
    fn out_of_bounds_is_fatal_and_unjournalled() {
        let (_dir, store, mut journal, mut state) = rig();
        let edge = Pose::new(Pos::new(0, 0, 0), Dir::NegZ);
        let mut world = GridWorld::empty(edge, 10);
        let mut movement = engaged_movement(edge);

        let err = movement
            .forward(&mut world, &mut journal, &store, &mut state)
            .unwrap_err();
        assert!(matches!(err, MineError::OutOfBounds(_)));
        assert!(journal.is_empty());
        assert_eq!(movement.pose(), edge);
    }

    #[test]
    fn descent_below_zero_is_legal_before_engagement() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(0, 0, 0), Dir::PosZ);
        let mut world = GridWorld::empty(start, 10);
        let mut movement = Movement::new(start, BoundingBox::new(8, 6, 16), 4);

        movement
            .down(&mut world, &mut journal, &store, &mut state)
            .unwrap();
        assert_eq!(movement.pose().pos.y, -1);
    }

    #[test]
    fn obstruction_is_dug_through() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(1, 0, 1), Dir::PosZ);
        let mut world =
            GridWorld::empty(start, 10).with_block(Pos::new(1, 0, 2), "minecraft:stone");
        let mut movement = engaged_movement(start);

        movement
            .forward(&mut world, &mut journal, &store, &mut state)
            .unwrap();
        assert_eq!(movement.pose().pos, Pos::new(1, 0, 2));
        assert_eq!(state.metrics.blocks_mined, 1);
    }

    #[test]
    fn back_cannot_clear_and_reports_blocked() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(1, 0, 1), Dir::PosZ);
        let mut world =
            GridWorld::empty(start, 10).with_block(Pos::new(1, 0, 0), "minecraft:stone");
        let mut movement = engaged_movement(start);

        let err = movement
            .back(&mut world, &mut journal, &store, &mut state)
            .unwrap_err();
        assert!(matches!(err, MineError::Blocked { .. }));
        assert!(journal.is_empty());
    }

    #[test]
    fn no_fuel_surfaces_fuel_exhausted() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(1, 0, 1), Dir::PosZ);
        let mut world = GridWorld::empty(start, 0);
        let mut movement = engaged_movement(start);

        let err = movement
            .forward(&mut world, &mut journal, &store, &mut state)
            .unwrap_err();
        assert!(matches!(err, MineError::FuelExhausted { .. }));
    }

    #[test]
    fn turns_do_not_consume_fuel() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(1, 0, 1), Dir::PosZ);
        let mut world = GridWorld::empty(start, 0);
        let mut movement = engaged_movement(start);

        movement
            .turn_right(&mut world, &mut journal, &store, &mut state)
            .unwrap();
        assert_eq!(movement.pose().dir, Dir::PosX);
        assert_eq!(world.fuel_level(), 0);
    }

    #[test]
    fn dig_clears_refilling_gravel() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(1, 0, 1), Dir::PosZ);
        let mut world =
            GridWorld::empty(start, 5).with_block(Pos::new(1, 1, 1), "minecraft:gravel");
        let mut movement = engaged_movement(start);

        let dug = movement
            .dig(&mut world, &mut journal, &store, &mut state, Face::Up)
            .unwrap();
        assert_eq!(dug, 1);
        assert!(!world.detect(Face::Up));
    }
}
