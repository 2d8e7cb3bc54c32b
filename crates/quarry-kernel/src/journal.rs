//! The ACID-verify journal: a durable log of pending non-idempotent
//! side-effects, each paired with a verifier that can decide after a crash
//! whether the effect took place.
//!
//! Usage per effect:
//! 1. `begin(kind, payload)` persists the intent before anything happens.
//! 2. The native action executes.
//! 3. `complete(id)` removes the entry once the effect is durable.
//!
//! On start, `resume` walks pending entries in id order and asks the
//! registered verifier about each. A confirmed entry is removed; the first
//! unconfirmed entry halts the walk and the worker must refuse to advance
//! state past that step.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::geometry::{Dir, Pose};
use crate::messages::{AgentId, Message};
use crate::plan::{Tunnel, TunnelId, TunnelState};
use crate::store::StateStore;
use crate::world::Face;

/// The registered verifier kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    MoveForward,
    MoveBack,
    MoveUp,
    MoveDown,
    TurnLeft,
    TurnRight,
    DigForward,
    DigUp,
    DigDown,
    ClaimTunnel,
    ReleaseTunnel,
    Deposit,
    Refuel,
    Broadcast,
    Calibrate,
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EffectKind::MoveForward => "move_forward",
            EffectKind::MoveBack => "move_back",
            EffectKind::MoveUp => "move_up",
            EffectKind::MoveDown => "move_down",
            EffectKind::TurnLeft => "turn_left",
            EffectKind::TurnRight => "turn_right",
            EffectKind::DigForward => "dig_forward",
            EffectKind::DigUp => "dig_up",
            EffectKind::DigDown => "dig_down",
            EffectKind::ClaimTunnel => "claim_tunnel",
            EffectKind::ReleaseTunnel => "release_tunnel",
            EffectKind::Deposit => "deposit",
            EffectKind::Refuel => "refuel",
            EffectKind::Broadcast => "broadcast",
            EffectKind::Calibrate => "calibrate",
        };
        f.write_str(s)
    }
}

/// One pending side-effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectEntry {
    pub id: u64,
    pub kind: EffectKind,
    pub payload: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

/// The on-disk shape: pending entries plus the id allocator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalFile {
    pub pending: BTreeMap<u64, EffectEntry>,
    pub next_id: u64,
}

// ── typed payloads ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovePayload {
    pub from: Pose,
    pub to: Pose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnPayload {
    pub from_dir: Dir,
    pub to_dir: Dir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigPayload {
    pub at: Pose,
    pub face: Face,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub tunnel: Tunnel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub tunnel_id: TunnelId,
    pub progress: u32,
    pub state: TunnelState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub seq: u64,
    pub to: Option<AgentId>,
    pub message: Message,
}

/// Decides whether a pending effect took place, observing the world or
/// re-attempting the action idempotently.
pub trait EffectVerifier {
    fn verify(&mut self, entry: &EffectEntry) -> Result<bool>;
}

/// What `resume` accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeOutcome {
    pub confirmed: usize,
    pub remaining: usize,
    /// First entry the verifier would not confirm, if any.
    pub halted_at: Option<(u64, EffectKind)>,
}

impl ResumeOutcome {
    pub fn is_clean(&self) -> bool {
        self.remaining == 0
    }
}

/// The live journal. All mutations persist before returning.
#[derive(Debug, Default)]
pub struct Journal {
    pending: BTreeMap<u64, EffectEntry>,
    next_id: u64,
}

impl Journal {
    /// Load from the store; a corrupt file has already been quarantined by
    /// the store and surfaces as an error here.
    pub fn load(store: &StateStore) -> Result<Self> {
        let file = store.load_journal()?.unwrap_or_default();
        Ok(Self {
            pending: file.pending,
            next_id: file.next_id.max(1),
        })
    }

    fn persist(&self, store: &StateStore) -> Result<()> {
        store.save_journal(&JournalFile {
            pending: self.pending.clone(),
            next_id: self.next_id,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Persist an intent. The returned id must be completed or aborted
    /// before the worker takes another step.
    pub fn begin<T: Serialize>(
        &mut self,
        store: &StateStore,
        kind: EffectKind,
        payload: &T,
    ) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let entry = EffectEntry {
            id,
            kind,
            payload: serde_json::to_value(payload)?,
            started_at: Utc::now(),
        };
        self.pending.insert(id, entry);
        self.persist(store)?;
        debug!(id = id, kind = %kind, "Journal begin");
        Ok(id)
    }

    /// The effect is durable; drop the intent.
    pub fn complete(&mut self, store: &StateStore, id: u64) -> Result<()> {
        if self.pending.remove(&id).is_some() {
            self.persist(store)?;
            debug!(id = id, "Journal complete");
        }
        Ok(())
    }

    /// The effect never happened and will not be retried; drop the intent.
    pub fn abort(&mut self, store: &StateStore, id: u64) -> Result<()> {
        if let Some(entry) = self.pending.remove(&id) {
            self.persist(store)?;
            debug!(id = id, kind = %entry.kind, "Journal abort");
        }
        Ok(())
    }

    /// Walk pending entries in order, removing each the verifier confirms.
    /// Stops at the first unconfirmed entry: later intents cannot be judged
    /// while an earlier one is in doubt.
    pub fn resume(
        &mut self,
        store: &StateStore,
        verifier: &mut dyn EffectVerifier,
    ) -> Result<ResumeOutcome> {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        let mut confirmed = 0;
        let mut halted_at = None;
        for id in ids {
            let entry = self.pending.get(&id).expect("id from pending").clone();
            if verifier.verify(&entry)? {
                self.pending.remove(&id);
                self.persist(store)?;
                confirmed += 1;
                info!(id = id, kind = %entry.kind, "Journal entry verified");
            } else {
                warn!(
                    id = id,
                    kind = %entry.kind,
                    "Journal entry UNVERIFIED; refusing to advance past it"
                );
                store.append_log(&format!(
                    "unverified journal entry {id} ({}); job progress halted",
                    entry.kind
                ))?;
                halted_at = Some((id, entry.kind));
                break;
            }
        }
        Ok(ResumeOutcome {
            confirmed,
            remaining: self.pending.len(),
            halted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), "q-test").unwrap();
        (dir, store)
    }

    /// Confirms a fixed set of entry ids.
    struct FixedVerifier {
        confirm: Vec<u64>,
        calls: usize,
    }

    impl EffectVerifier for FixedVerifier {
        fn verify(&mut self, entry: &EffectEntry) -> Result<bool> {
            self.calls += 1;
            Ok(self.confirm.contains(&entry.id))
        }
    }

    fn turn_payload() -> TurnPayload {
        TurnPayload {
            from_dir: Dir::PosZ,
            to_dir: Dir::PosX,
        }
    }

    #[test]
    fn begin_persists_before_completion() {
        let (_dir, store) = test_store();
        let mut journal = Journal::default();
        let id = journal
            .begin(&store, EffectKind::TurnRight, &turn_payload())
            .unwrap();

        // Crash here: a fresh load still sees the pending intent.
        let reloaded = Journal::load(&store).unwrap();
        assert_eq!(reloaded.pending_len(), 1);

        journal.complete(&store, id).unwrap();
        let reloaded = Journal::load(&store).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn ids_stay_monotonic_across_reload() {
        let (_dir, store) = test_store();
        let mut journal = Journal::default();
        let a = journal
            .begin(&store, EffectKind::TurnLeft, &turn_payload())
            .unwrap();
        journal.complete(&store, a).unwrap();

        let mut reloaded = Journal::load(&store).unwrap();
        let b = reloaded
            .begin(&store, EffectKind::TurnLeft, &turn_payload())
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn resume_removes_confirmed_entries() {
        let (_dir, store) = test_store();
        let mut journal = Journal::default();
        let a = journal
            .begin(&store, EffectKind::TurnLeft, &turn_payload())
            .unwrap();
        let b = journal
            .begin(&store, EffectKind::TurnRight, &turn_payload())
            .unwrap();

        let mut verifier = FixedVerifier {
            confirm: vec![a, b],
            calls: 0,
        };
        let outcome = journal.resume(&store, &mut verifier).unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.confirmed, 2);
        assert!(journal.is_empty());
    }

    #[test]
    fn resume_halts_at_first_unconfirmed_entry() {
        let (_dir, store) = test_store();
        let mut journal = Journal::default();
        let a = journal
            .begin(&store, EffectKind::TurnLeft, &turn_payload())
            .unwrap();
        let _b = journal
            .begin(&store, EffectKind::TurnRight, &turn_payload())
            .unwrap();
        let c = journal
            .begin(&store, EffectKind::TurnLeft, &turn_payload())
            .unwrap();

        let mut verifier = FixedVerifier {
            confirm: vec![a, c],
            calls: 0,
        };
        let outcome = journal.resume(&store, &mut verifier).unwrap();
        assert_eq!(outcome.confirmed, 1);
        assert_eq!(outcome.remaining, 2);
        assert!(outcome.halted_at.is_some());
        // The entry after the unconfirmed one was never even asked about.
        assert_eq!(verifier.calls, 2);
    }

    #[test]
    fn resume_twice_equals_resume_once() {
        let (_dir, store) = test_store();
        let mut journal = Journal::default();
        let a = journal
            .begin(&store, EffectKind::TurnLeft, &turn_payload())
            .unwrap();
        journal
            .begin(&store, EffectKind::TurnRight, &turn_payload())
            .unwrap();

        let mut verifier = FixedVerifier {
            confirm: vec![a],
            calls: 0,
        };
        let first = journal.resume(&store, &mut verifier).unwrap();
        let second = journal.resume(&store, &mut verifier).unwrap();
        assert_eq!(first.remaining, second.remaining);
        assert_eq!(second.confirmed, 0);
        assert_eq!(first.halted_at, second.halted_at);
    }

    #[test]
    fn abort_drops_the_intent() {
        let (_dir, store) = test_store();
        let mut journal = Journal::default();
        let id = journal
            .begin(&store, EffectKind::MoveForward, &turn_payload())
            .unwrap();
        journal.abort(&store, id).unwrap();
        assert!(Journal::load(&store).unwrap().is_empty());
    }
}
