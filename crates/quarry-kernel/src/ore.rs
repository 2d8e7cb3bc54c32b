//! Shared ore registry.
//!
//! Observations are deduped by `(position, block)` and monotone: an entry
//! moves `queued -> mined` exactly once and never back. Any agent may promote
//! a queued entry to mined upon observing the block is gone, which resolves
//! the case where a peer consumed the vein first.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::geometry::Pos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OreStatus {
    Queued,
    Mined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OreEntry {
    pub pos: Pos,
    pub block: String,
    pub status: OreStatus,
    pub observed_at: DateTime<Utc>,
}

/// Per-agent replica of the observed-ore set.
///
/// Keyed in memory by `(position, block)`; persisted as a flat entry list
/// (JSON maps cannot carry composite keys).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OreRegistry {
    #[serde(
        serialize_with = "entries_as_list",
        deserialize_with = "entries_from_list"
    )]
    entries: BTreeMap<(Pos, String), OreEntry>,
}

fn entries_as_list<S: Serializer>(
    entries: &BTreeMap<(Pos, String), OreEntry>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(entries.values())
}

fn entries_from_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<(Pos, String), OreEntry>, D::Error> {
    let list = Vec::<OreEntry>::deserialize(deserializer)?;
    Ok(list
        .into_iter()
        .map(|entry| ((entry.pos, entry.block.clone()), entry))
        .collect())
}

impl OreRegistry {
    /// Record an observation. Returns true if this is a new queued entry;
    /// re-observing a mined block is a no-op.
    pub fn observe(&mut self, pos: Pos, block: &str) -> bool {
        let key = (pos, block.to_string());
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            OreEntry {
                pos,
                block: block.to_string(),
                status: OreStatus::Queued,
                observed_at: Utc::now(),
            },
        );
        debug!(pos = %pos, block = block, "Ore observed");
        true
    }

    /// Promote an entry to mined. Inserting unobserved positions is allowed
    /// so a flood-fill can record blocks it consumed before they were ever
    /// scanned.
    pub fn mark_mined(&mut self, pos: Pos, block: &str) {
        let key = (pos, block.to_string());
        let entry = self.entries.entry(key).or_insert_with(|| OreEntry {
            pos,
            block: block.to_string(),
            status: OreStatus::Mined,
            observed_at: Utc::now(),
        });
        entry.status = OreStatus::Mined;
    }

    pub fn status(&self, pos: Pos, block: &str) -> Option<OreStatus> {
        self.entries
            .get(&(pos, block.to_string()))
            .map(|e| e.status)
    }

    pub fn is_queued(&self, pos: Pos, block: &str) -> bool {
        self.status(pos, block) == Some(OreStatus::Queued)
    }

    /// First queued entry in key order, if any.
    pub fn next_queued(&self) -> Option<&OreEntry> {
        self.entries
            .values()
            .find(|e| e.status == OreStatus::Queued)
    }

    pub fn queued_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == OreStatus::Queued)
            .count()
    }

    pub fn entries(&self) -> impl Iterator<Item = &OreEntry> {
        self.entries.values()
    }
}
