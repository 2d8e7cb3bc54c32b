//! Navigator: axis-ordered pathing from A to B, one primitive per call.
//!
//! Movement is ordered `y`, then `x`, then `z`. The fixed order keeps a
//! resumed agent on the same intermediate pose sequence after a crash and
//! makes collision avoidance compositional: distinct tunnels never share a
//! `y` mid-traverse, and the spawn column plus the `y = 0` branch are the
//! only shared corridors.
//!
//! The navigator holds no state; each call derives the next primitive from
//! the current pose, which is what makes it crash-safe.

use crate::error::Result;
use crate::geometry::{Dir, Pos};
use crate::journal::Journal;
use crate::movement::Movement;
use crate::store::{PersistedState, StateStore};
use crate::world::World;

/// What a single navigation call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavStep {
    /// Already standing on the target cell.
    Arrived,
    /// One turn or one cell of travel was performed.
    Moved,
}

/// Rotate one quarter turn toward `target_dir`. Returns true when already
/// facing it (no turn performed).
pub fn face(
    movement: &mut Movement,
    world: &mut dyn World,
    journal: &mut Journal,
    store: &StateStore,
    state: &mut PersistedState,
    target_dir: Dir,
) -> Result<bool> {
    let current = movement.pose().dir;
    if current == target_dir {
        return Ok(true);
    }
    if target_dir == current.right() {
        movement.turn_right(world, journal, store, state)?;
    } else {
        // Left or opposite; the opposite case resolves over two calls.
        movement.turn_left(world, journal, store, state)?;
    }
    Ok(false)
}

/// Next waypoint for corridor-disciplined travel to a cell on the `z = 0`
/// lattice (a tunnel stand or the spawn column).
///
/// Agents keep to the reserved transit routes: back out of the current
/// corridor to its mouth, ride the layer branch to the spawn column for any
/// vertical travel, then walk the destination layer's branch and enter the
/// target tunnel along its own line. Each stage is a cell the axis-ordered
/// walk reaches without leaving the route.
pub fn corridor_target(pos: Pos, stand: Pos) -> Pos {
    if pos.x == stand.x && pos.y == stand.y {
        // On the target tunnel's line already: straight in (or out).
        return stand;
    }
    if pos.z != 0 {
        // Back out of whatever corridor we are in.
        return Pos::new(pos.x, pos.y, 0);
    }
    if pos.y != stand.y && pos.x != 0 {
        // Vertical travel happens on the spawn column only.
        return Pos::new(0, pos.y, 0);
    }
    if pos.y != stand.y {
        return Pos::new(0, stand.y, 0);
    }
    Pos::new(stand.x, stand.y, 0)
}

/// Perform one step of the `y`, `x`, `z` walk toward `target`.
pub fn step_toward(
    movement: &mut Movement,
    world: &mut dyn World,
    journal: &mut Journal,
    store: &StateStore,
    state: &mut PersistedState,
    target: Pos,
) -> Result<NavStep> {
    let pos = movement.pose().pos;
    if pos == target {
        return Ok(NavStep::Arrived);
    }

    if pos.y < target.y {
        movement.up(world, journal, store, state)?;
        return Ok(NavStep::Moved);
    }
    if pos.y > target.y {
        movement.down(world, journal, store, state)?;
        return Ok(NavStep::Moved);
    }

    let dir = Dir::toward_x(pos, target)
        .or_else(|| Dir::toward_z(pos, target))
        .expect("pos differs from target on x or z");
    if face(movement, world, journal, store, state, dir)? {
        movement.forward(world, journal, store, state)?;
    }
    Ok(NavStep::Moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BoundingBox, Pose};
    use crate::movement::tests::{rig, GridWorld};

    fn walk_to(start: Pose, target: Pos) -> Vec<Pos> {
        let (_dir, store, mut journal, mut state) = rig();
        let mut world = GridWorld::empty(start, 100);
        let mut movement = Movement::new(start, BoundingBox::new(16, 16, 16), 4);
        movement.engage_bounds();

        let mut trail = vec![start.pos];
        for _ in 0..200 {
            match step_toward(
                &mut movement,
                &mut world,
                &mut journal,
                &store,
                &mut state,
                target,
            )
            .unwrap()
            {
                NavStep::Arrived => break,
                NavStep::Moved => trail.push(movement.pose().pos),
            }
        }
        assert_eq!(movement.pose().pos, target);
        trail
    }

    #[test]
    fn walk_orders_axes_y_then_x_then_z() {
        let start = Pose::new(Pos::new(0, 0, 0), Dir::PosZ);
        let trail = walk_to(start, Pos::new(2, 3, 1));

        // y settles before x moves, x settles before z moves.
        let first_x_change = trail.iter().position(|p| p.x != 0).unwrap();
        let first_z_change = trail.iter().position(|p| p.z != 0).unwrap();
        let last_y_change = trail
            .iter()
            .rposition(|p| p.y != 3)
            .map(|i| i + 1)
            .unwrap_or(0);
        assert!(last_y_change <= first_x_change);
        assert!(first_x_change < first_z_change);
    }

    #[test]
    fn corridor_route_stages_through_the_column() {
        // Deep in a tunnel on layer 0, heading for a tunnel on layer 3.
        let stand = Pos::new(6, 3, 0);
        let mut pos = Pos::new(3, 0, 11);
        let mut stages = vec![pos];
        while pos != stand {
            let next = corridor_target(pos, stand);
            assert_ne!(next, pos, "route must make progress");
            pos = next;
            stages.push(pos);
        }
        assert_eq!(
            stages,
            vec![
                Pos::new(3, 0, 11),
                Pos::new(3, 0, 0),  // corridor mouth
                Pos::new(0, 0, 0),  // spawn column
                Pos::new(0, 3, 0),  // climb on the column
                Pos::new(6, 3, 0),  // layer branch to the stand
            ]
        );
    }

    #[test]
    fn corridor_route_enters_own_tunnel_directly() {
        let stand = Pos::new(3, 0, 0);
        assert_eq!(corridor_target(Pos::new(3, 0, 7), stand), stand);
        assert_eq!(corridor_target(Pos::new(0, 0, 0), stand), stand);
    }

    #[test]
    fn walk_is_deterministic() {
        let start = Pose::new(Pos::new(1, 2, 3), Dir::NegX);
        let a = walk_to(start, Pos::new(4, 0, 7));
        let b = walk_to(start, Pos::new(4, 0, 7));
        assert_eq!(a, b);
    }

    #[test]
    fn arrived_without_motion_on_target_cell() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(5, 5, 5), Dir::PosZ);
        let mut world = GridWorld::empty(start, 10);
        let mut movement = Movement::new(start, BoundingBox::new(16, 16, 16), 4);
        movement.engage_bounds();

        let step = step_toward(
            &mut movement,
            &mut world,
            &mut journal,
            &store,
            &mut state,
            Pos::new(5, 5, 5),
        )
        .unwrap();
        assert_eq!(step, NavStep::Arrived);
        assert_eq!(world.fuel_level(), 10);
    }

    #[test]
    fn facing_resolves_before_stepping() {
        let (_dir, store, mut journal, mut state) = rig();
        let start = Pose::new(Pos::new(0, 0, 0), Dir::NegX);
        let mut world = GridWorld::empty(start, 10);
        let mut movement = Movement::new(start, BoundingBox::new(16, 16, 16), 4);
        movement.engage_bounds();

        // Facing the opposite way costs two turn calls before the step.
        let mut calls = 0;
        while movement.pose().pos == Pos::new(0, 0, 0) {
            step_toward(
                &mut movement,
                &mut world,
                &mut journal,
                &store,
                &mut state,
                Pos::new(3, 0, 0),
            )
            .unwrap();
            calls += 1;
        }
        assert_eq!(calls, 3);
        assert_eq!(movement.pose().pos, Pos::new(1, 0, 0));
        assert_eq!(movement.pose().dir, Dir::PosX);
    }
}
