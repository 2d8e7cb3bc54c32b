//! Error kinds surfaced by the kernel.
//!
//! Each variant maps to one handling rule in the worker: `OutOfBounds` is
//! fatal for the step, `Blocked` and `PeerUnreachable` retry bounded,
//! `FuelExhausted` escalates to a refuel job, `ChestEmpty` re-queues with
//! backoff, `Unverified` halts job progress, `ConfigDrift` halts destructive
//! jobs, and `JournalCorrupt` requires operator attention.

use crate::geometry::Pos;
use crate::journal::EffectKind;
use crate::messages::AgentId;

#[derive(Debug, thiserror::Error)]
pub enum MineError {
    #[error("target {0} is outside the bounding box")]
    OutOfBounds(Pos),

    #[error("movement blocked after {attempts} clearing attempts")]
    Blocked { attempts: u32 },

    #[error("fuel exhausted: level {level}, need {needed}")]
    FuelExhausted { level: u64, needed: u64 },

    #[error("chest at {0} is empty")]
    ChestEmpty(Pos),

    #[error("journal entry {id} ({kind}) could not be verified")]
    Unverified { id: u64, kind: EffectKind },

    #[error("configuration drift: local version {local}, peer announced {remote}")]
    ConfigDrift { local: u64, remote: u64 },

    #[error("peer {0} unreachable")]
    PeerUnreachable(AgentId),

    #[error("journal corrupt: {0}")]
    JournalCorrupt(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl MineError {
    /// Short status token carried in the next heartbeat so peers observe
    /// fleet health.
    pub fn status_token(&self) -> &'static str {
        match self {
            MineError::OutOfBounds(_) => "out_of_bounds",
            MineError::Blocked { .. } => "blocked",
            MineError::FuelExhausted { .. } => "fuel_exhausted",
            MineError::ChestEmpty(_) => "chest_empty",
            MineError::Unverified { .. } => "unverified",
            MineError::ConfigDrift { .. } => "config_drift",
            MineError::PeerUnreachable(_) => "peer_unreachable",
            MineError::JournalCorrupt(_) => "journal_corrupt",
            MineError::InvalidConfig(_) => "invalid_config",
            MineError::Io(_) => "io",
            MineError::Serde(_) => "serde",
        }
    }
}

pub type Result<T> = std::result::Result<T, MineError>;
