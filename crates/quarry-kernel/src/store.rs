//! Agent-local persistence.
//!
//! Every persisted file is replaced atomically (write to a temp sibling,
//! fsync, rename) so a crash mid-write leaves either the old or the new
//! content, never a torn file. The job ledger and operator log are
//! append-only instead.
//!
//! ```text
//! <dir>/
//!   config.<quarryId>     # quarry configuration
//!   state                 # pose, plan replica, ore registry, recall, metrics
//!   journal               # pending side-effect entries
//!   journal.quarantine    # un-parseable entries awaiting the operator
//!   jobs.jsonl            # append-only job ledger
//!   log                   # append-only operator log
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{MineError, Result};
use crate::geometry::Pose;
use crate::jobs::JobRecord;
use crate::journal::JournalFile;
use crate::messages::AgentId;
use crate::ore::OreRegistry;
use crate::plan::TunnelPlan;
use crate::config::QuarryConfig;

/// Counters carried in the state file and surfaced in run reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub steps: u64,
    pub blocks_mined: u64,
    pub ore_blocks_mined: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub tunnels_completed: u64,
}

/// Last view of a peer, persisted for operator visibility only; the live
/// membership table is rebuilt from heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub status: String,
    pub fuel: u64,
    pub last_seen_tick: u64,
}

/// Everything durable about one agent apart from the journal and the job
/// ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub pose: Pose,
    pub calibrated: bool,
    pub config_version: u64,
    pub tunnels: TunnelPlan,
    pub ore: OreRegistry,
    pub recall: bool,
    pub peers: BTreeMap<AgentId, PeerSnapshot>,
    pub metrics: Metrics,
}

/// Handle to one agent's data directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    quarry_id: String,
}

impl StateStore {
    pub fn open(dir: impl Into<PathBuf>, quarry_id: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            quarry_id: quarry_id.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn config_path(&self) -> PathBuf {
        self.path(&format!("config.{}", self.quarry_id))
    }

    /// Write-to-temp, fsync, rename.
    fn atomic_write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn append_line(&self, name: &str, line: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    // ── state ──

    pub fn save_state(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_vec(state)?;
        self.atomic_write("state", &json)
    }

    pub fn load_state(&self) -> Result<Option<PersistedState>> {
        let path = self.path("state");
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    // ── configuration ──

    pub fn save_config(&self, config: &QuarryConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        let name = format!("config.{}", self.quarry_id);
        self.atomic_write(&name, &json)
    }

    pub fn load_config(&self) -> Result<Option<QuarryConfig>> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    // ── journal ──

    pub fn save_journal(&self, journal: &JournalFile) -> Result<()> {
        let json = serde_json::to_vec(journal)?;
        self.atomic_write("journal", &json)
    }

    /// Load the journal, quarantining anything un-parseable. A quarantined
    /// entry is unrecoverable without the operator, so this surfaces
    /// [`MineError::JournalCorrupt`] after moving the offender aside.
    pub fn load_journal(&self) -> Result<Option<JournalFile>> {
        let path = self.path("journal");
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str::<JournalFile>(&raw) {
            Ok(journal) => Ok(Some(journal)),
            Err(parse_err) => {
                error!(error = %parse_err, "Journal failed to parse; quarantining");
                self.append_line("journal.quarantine", &raw)?;
                fs::remove_file(&path)?;
                self.append_log(&format!(
                    "journal quarantined: {parse_err}; operator attention required"
                ))?;
                Err(MineError::JournalCorrupt(parse_err.to_string()))
            }
        }
    }

    // ── job ledger ──

    pub fn append_job_record(&self, record: &JobRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.append_line("jobs.jsonl", &line)
    }

    pub fn load_job_records(&self) -> Result<Vec<JobRecord>> {
        let path = self.path("jobs.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path)?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn trailing line from a crash mid-append is expected;
                    // anything else is worth the operator's eye.
                    warn!(error = %e, "Skipping unreadable job ledger line");
                }
            }
        }
        Ok(records)
    }

    // ── operator log ──

    pub fn append_log(&self, message: &str) -> Result<()> {
        let line = format!("{} {}", Utc::now().to_rfc3339(), message);
        self.append_line("log", &line)
    }
}
