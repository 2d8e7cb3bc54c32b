//! Fuel and inventory: the spawn-column chest protocols and worst-case fuel
//! accounting.
//!
//! The fuel chest and deposit chest sit behind the spawn column. An agent
//! interacts with a chest by standing on the column cell in front of it,
//! facing opposite the spawn facing. Rounds are bounded (one suck, one
//! inventory sweep) so each is a legal worker step.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::QuarryConfig;
use crate::error::Result;
use crate::geometry::Pos;
use crate::jobs::JobKind;
use crate::journal::{EffectKind, Journal};
use crate::plan::TunnelPlan;
use crate::store::{PersistedState, StateStore};
use crate::world::{World, SLOT_COUNT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefuelPayload {
    pub target: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositPayload {
    pub keep_fuel_items: u32,
}

/// Result of one chest round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyOutcome {
    Done,
    /// Made progress; call again next tick.
    InProgress,
    /// The chest has nothing left and the goal is unmet.
    ChestEmpty,
}

/// Worst-case fuel cost of running `kind` from `from`, ignoring the return
/// trip (accounted separately).
pub fn estimated_cost(
    kind: &JobKind,
    from: Pos,
    plan: &TunnelPlan,
    config: &QuarryConfig,
) -> u64 {
    match kind {
        JobKind::Recall => from.manhattan(Pos::ORIGIN) + config.bounds.max_y as u64,
        JobKind::Refuel => from.manhattan(config.chest_stand(config.fuel_chest_offset)),
        JobKind::OreMine { pos, .. } => {
            from.manhattan(*pos) + u64::from(config.vein_cap) * 2
        }
        JobKind::TunnelMine { tunnel_id } => match plan.get(tunnel_id) {
            Some(t) => {
                let remaining = u64::from(t.length.saturating_sub(t.progress));
                from.manhattan(t.working_cell()) + remaining
            }
            None => 0,
        },
    }
}

/// The claim gate: a job runs only if fuel covers its cost plus the walk
/// home plus the safety margin.
pub fn has_fuel_for(
    kind: &JobKind,
    fuel: u64,
    from: Pos,
    plan: &TunnelPlan,
    config: &QuarryConfig,
) -> bool {
    // Recall must never be starved out by its own gate.
    if matches!(kind, JobKind::Recall | JobKind::Refuel) {
        return true;
    }
    let need = estimated_cost(kind, from, plan, config)
        + from.manhattan(Pos::ORIGIN)
        + config.safety_margin;
    fuel >= need
}

/// One refuel round at the fuel chest: suck a stack, burn what is allowed
/// fuel, return the rest. The caller has already navigated to the stand cell
/// and faced the chest.
pub fn refuel_round(
    world: &mut dyn World,
    journal: &mut Journal,
    store: &StateStore,
    state: &mut PersistedState,
    config: &QuarryConfig,
) -> Result<SupplyOutcome> {
    if world.fuel_level() >= config.target_fuel {
        return Ok(SupplyOutcome::Done);
    }
    let id = journal.begin(
        store,
        EffectKind::Refuel,
        &RefuelPayload {
            target: config.target_fuel,
        },
    )?;

    let empty_before: Vec<usize> = (0..SLOT_COUNT).filter(|&s| world.slot(s).is_none()).collect();
    let sucked = world.suck();

    let mut gained = 0;
    for slot in 0..SLOT_COUNT {
        let Some(stack) = world.slot(slot) else {
            continue;
        };
        if config.allowed_fuel.contains(&stack.item) {
            if world.fuel_level() < config.target_fuel {
                gained += world.refuel(slot);
            }
        } else if empty_before.contains(&slot) {
            // Non-fuel that arrived with this suck goes back; cargo that was
            // already on board is left for the deposit chest.
            world.drop_items(slot, stack.count);
        }
    }

    store.save_state(state)?;
    journal.complete(store, id)?;

    let level = world.fuel_level();
    if level >= config.target_fuel {
        info!(fuel = level, "Refuel complete");
        return Ok(SupplyOutcome::Done);
    }
    if !sucked && gained == 0 {
        debug!(fuel = level, "Fuel chest empty");
        return Ok(SupplyOutcome::ChestEmpty);
    }
    Ok(SupplyOutcome::InProgress)
}

/// One deposit round at the deposit chest: drop everything except up to
/// `keep_fuel_items` of fuel for autonomy.
pub fn deposit_round(
    world: &mut dyn World,
    journal: &mut Journal,
    store: &StateStore,
    state: &mut PersistedState,
    config: &QuarryConfig,
) -> Result<SupplyOutcome> {
    let id = journal.begin(
        store,
        EffectKind::Deposit,
        &DepositPayload {
            keep_fuel_items: config.keep_fuel_items,
        },
    )?;

    let mut keep_budget = config.keep_fuel_items;
    for slot in 0..SLOT_COUNT {
        let Some(stack) = world.slot(slot) else {
            continue;
        };
        if config.allowed_fuel.contains(&stack.item) && keep_budget > 0 {
            let kept = stack.count.min(keep_budget);
            keep_budget -= kept;
            if stack.count > kept {
                world.drop_items(slot, stack.count - kept);
            }
        } else {
            world.drop_items(slot, stack.count);
        }
    }

    store.save_state(state)?;
    journal.complete(store, id)?;
    Ok(SupplyOutcome::Done)
}

/// Whether the inventory holds anything besides retained fuel.
pub fn has_cargo(world: &dyn World, config: &QuarryConfig) -> bool {
    let mut fuel_items = 0u32;
    for slot in 0..SLOT_COUNT {
        if let Some(stack) = world.slot(slot) {
            if config.allowed_fuel.contains(&stack.item) {
                fuel_items += stack.count;
            } else {
                return true;
            }
        }
    }
    fuel_items > config.keep_fuel_items
}
