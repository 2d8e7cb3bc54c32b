//! Per-agent persistent priority job queue.
//!
//! The durable form is an append-only ledger of records; the live queue is a
//! materialized min-heap keyed by `(priority, created_at, id)`. Replaying the
//! ledger reconstructs the latest status per job id, so a crash between any
//! two appends loses nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::geometry::Pos;
use crate::plan::TunnelId;
use crate::store::StateStore;

/// What a job does. Priority is a function of the kind: recall preempts
/// refuel preempts ore preempts tunnel work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Recall,
    Refuel,
    OreMine { pos: Pos, block: String },
    TunnelMine { tunnel_id: TunnelId },
}

impl JobKind {
    pub fn priority(&self) -> u8 {
        match self {
            JobKind::Recall => 0,
            JobKind::Refuel => 1,
            JobKind::OreMine { .. } => 2,
            JobKind::TunnelMine { .. } => 3,
        }
    }

    /// System jobs have at most one live instance per agent.
    pub fn is_system(&self) -> bool {
        matches!(self, JobKind::Recall | JobKind::Refuel)
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Recall => "recall",
            JobKind::Refuel => "refuel",
            JobKind::OreMine { .. } => "ore_mine",
            JobKind::TunnelMine { .. } => "tunnel_mine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub priority: u8,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
}

/// One ledger line. The ledger is append-only; status is whatever the last
/// record for an id says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobRecord {
    Enqueued { job: Job },
    Claimed { id: u64, at: DateTime<Utc> },
    Completed { id: u64, at: DateTime<Utc> },
    Failed { id: u64, requeue: bool, at: DateTime<Utc> },
    /// Put back without an attempt penalty (e.g. pre-empted by refuel).
    Yielded { id: u64, at: DateTime<Utc> },
}

/// Outcome of failing the active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    Requeued,
    Dropped,
}

type QueueKey = (u8, i64, u64);

fn key_of(job: &Job) -> QueueKey {
    (job.priority, job.created_at.timestamp_millis(), job.id)
}

/// The live queue. At most one job is active at a time.
#[derive(Debug, Default)]
pub struct JobQueue {
    next_id: u64,
    pending: BTreeMap<QueueKey, Job>,
    active: Option<Job>,
}

impl JobQueue {
    /// Rebuild the queue from the ledger. Jobs that were claimed when the
    /// process died come back as queued; the journal owns any half-applied
    /// effects.
    pub fn replay(records: Vec<JobRecord>) -> Self {
        let mut jobs: BTreeMap<u64, Job> = BTreeMap::new();
        let mut next_id = 1;
        for record in records {
            match record {
                JobRecord::Enqueued { mut job } => {
                    next_id = next_id.max(job.id + 1);
                    job.status = JobStatus::Queued;
                    jobs.insert(job.id, job);
                }
                JobRecord::Claimed { id, .. } => {
                    if let Some(job) = jobs.get_mut(&id) {
                        job.status = JobStatus::Claimed;
                    }
                }
                JobRecord::Completed { id, .. } => {
                    jobs.remove(&id);
                }
                JobRecord::Failed { id, requeue, at } => {
                    if requeue {
                        if let Some(job) = jobs.get_mut(&id) {
                            job.status = JobStatus::Queued;
                            job.attempts += 1;
                            job.created_at = at;
                        }
                    } else {
                        jobs.remove(&id);
                    }
                }
                JobRecord::Yielded { id, at } => {
                    if let Some(job) = jobs.get_mut(&id) {
                        job.status = JobStatus::Queued;
                        job.created_at = at;
                    }
                }
            }
        }
        let mut queue = Self {
            next_id,
            pending: BTreeMap::new(),
            active: None,
        };
        for (_, mut job) in jobs {
            job.status = JobStatus::Queued;
            queue.pending.insert(key_of(&job), job);
        }
        queue
    }

    pub fn active(&self) -> Option<&Job> {
        self.active.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// Whether a job of this kind label is live (pending or active).
    pub fn has_live(&self, label: &str) -> bool {
        self.active
            .as_ref()
            .map(|j| j.kind.label() == label)
            .unwrap_or(false)
            || self.pending.values().any(|j| j.kind.label() == label)
    }

    /// Lowest priority value among pending jobs, if any.
    pub fn min_pending_priority(&self) -> Option<u8> {
        self.pending.keys().next().map(|(p, _, _)| *p)
    }

    /// Append a job. System jobs are idempotent: a live instance makes this
    /// a no-op.
    pub fn enqueue(&mut self, store: &StateStore, kind: JobKind) -> Result<Option<u64>> {
        if kind.is_system() && self.has_live(kind.label()) {
            return Ok(None);
        }
        let job = Job {
            id: self.next_id,
            priority: kind.priority(),
            kind,
            attempts: 0,
            created_at: Utc::now(),
            status: JobStatus::Queued,
        };
        self.next_id += 1;
        store.append_job_record(&JobRecord::Enqueued { job: job.clone() })?;
        info!(job = job.id, kind = job.kind.label(), priority = job.priority, "Job enqueued");
        let id = job.id;
        self.pending.insert(key_of(&job), job);
        Ok(Some(id))
    }

    /// Highest-priority pending job without claiming it.
    pub fn peek(&self) -> Option<&Job> {
        self.pending.values().next()
    }

    /// Claim the highest-priority pending job. Returns `None` when a job is
    /// already active or the queue is empty.
    pub fn pop(&mut self, store: &StateStore) -> Result<Option<Job>> {
        if self.active.is_some() {
            return Ok(None);
        }
        let Some((&key, _)) = self.pending.iter().next() else {
            return Ok(None);
        };
        let mut job = self.pending.remove(&key).expect("key taken from iterator");
        job.status = JobStatus::Claimed;
        store.append_job_record(&JobRecord::Claimed {
            id: job.id,
            at: Utc::now(),
        })?;
        debug!(job = job.id, kind = job.kind.label(), "Job claimed");
        self.active = Some(job.clone());
        Ok(Some(job))
    }

    /// Finish the active job successfully.
    pub fn complete_active(&mut self, store: &StateStore) -> Result<Option<Job>> {
        let Some(mut job) = self.active.take() else {
            return Ok(None);
        };
        job.status = JobStatus::Completed;
        store.append_job_record(&JobRecord::Completed {
            id: job.id,
            at: Utc::now(),
        })?;
        info!(job = job.id, kind = job.kind.label(), "Job completed");
        Ok(Some(job))
    }

    /// Fail the active job. With `requeue` and attempts remaining it goes to
    /// the tail of its priority band; otherwise it is dropped.
    pub fn fail_active(
        &mut self,
        store: &StateStore,
        requeue: bool,
        max_failures: u32,
    ) -> Result<FailDisposition> {
        let Some(mut job) = self.active.take() else {
            return Ok(FailDisposition::Dropped);
        };
        job.attempts += 1;
        let keep = requeue && job.attempts < max_failures;
        store.append_job_record(&JobRecord::Failed {
            id: job.id,
            requeue: keep,
            at: Utc::now(),
        })?;
        if keep {
            job.status = JobStatus::Queued;
            job.created_at = Utc::now();
            info!(job = job.id, attempts = job.attempts, "Job re-queued after failure");
            self.pending.insert(key_of(&job), job);
            Ok(FailDisposition::Requeued)
        } else {
            info!(job = job.id, attempts = job.attempts, "Job dropped after repeated failure");
            Ok(FailDisposition::Dropped)
        }
    }

    /// Put the active job back without an attempt penalty, so a
    /// higher-priority job (refuel, recall) can run first.
    pub fn yield_active(&mut self, store: &StateStore) -> Result<()> {
        let Some(mut job) = self.active.take() else {
            return Ok(());
        };
        store.append_job_record(&JobRecord::Yielded {
            id: job.id,
            at: Utc::now(),
        })?;
        debug!(job = job.id, kind = job.kind.label(), "Job yielded");
        job.status = JobStatus::Queued;
        job.created_at = Utc::now();
        self.pending.insert(key_of(&job), job);
        Ok(())
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

    #[test]
    fn priority_matches_type_ordering() {
        assert!(JobKind::Recall.priority() < JobKind::Refuel.priority());
        assert!(
            JobKind::Refuel.priority()
                < JobKind::OreMine {
                    pos: Pos::ORIGIN,
                    block: "minecraft:iron_ore".into()
                }
                .priority()
        );
    }

    #[test]
    fn pop_takes_highest_priority_first() {
        let (_dir, store) = test_store();
        let mut queue = JobQueue::default();
        queue
            .enqueue(
                &store,
                JobKind::TunnelMine {
                    tunnel_id: TunnelId::from_index(1),
                },
            )
            .unwrap();
        queue.enqueue(&store, JobKind::Refuel).unwrap();
        let job = queue.pop(&store).unwrap().unwrap();
        assert_eq!(job.kind.label(), "refuel");
        // Active job's priority <= every pending job's priority.
        assert!(job.priority <= queue.min_pending_priority().unwrap());
    }

    #[test]
    fn only_one_job_active_at_a_time() {
        let (_dir, store) = test_store();
        let mut queue = JobQueue::default();
        queue.enqueue(&store, JobKind::Recall).unwrap();
        queue.enqueue(&store, JobKind::Refuel).unwrap();
        assert!(queue.pop(&store).unwrap().is_some());
        assert!(queue.pop(&store).unwrap().is_none());
    }

    #[test]
    fn system_jobs_are_idempotent() {
        let (_dir, store) = test_store();
        let mut queue = JobQueue::default();
        assert!(queue.enqueue(&store, JobKind::Recall).unwrap().is_some());
        assert!(queue.enqueue(&store, JobKind::Recall).unwrap().is_none());
        // Still idempotent while active.
        queue.pop(&store).unwrap();
        assert!(queue.enqueue(&store, JobKind::Recall).unwrap().is_none());
    }

    #[test]
    fn failed_job_requeues_until_attempts_exhausted() {
        let (_dir, store) = test_store();
        let mut queue = JobQueue::default();
        queue.enqueue(&store, JobKind::Refuel).unwrap();
        queue.pop(&store).unwrap();
        assert_eq!(
            queue.fail_active(&store, true, 2).unwrap(),
            FailDisposition::Requeued
        );
        queue.pop(&store).unwrap();
        assert_eq!(
            queue.fail_active(&store, true, 2).unwrap(),
            FailDisposition::Dropped
        );
        assert!(queue.is_idle());
    }

    #[test]
    fn replay_reconstructs_the_live_queue() {
        let (_dir, store) = test_store();
        let mut queue = JobQueue::default();
        queue.enqueue(&store, JobKind::Refuel).unwrap();
        queue
            .enqueue(
                &store,
                JobKind::TunnelMine {
                    tunnel_id: TunnelId::from_index(2),
                },
            )
            .unwrap();
        queue.pop(&store).unwrap();
        queue.complete_active(&store).unwrap();
        // Crash here: the claimed-but-unfinished tunnel job must survive.
        queue
            .enqueue(
                &store,
                JobKind::OreMine {
                    pos: Pos::new(2, 0, 5),
                    block: "minecraft:iron_ore".into(),
                },
            )
            .unwrap();
        queue.pop(&store).unwrap();

        let replayed = JobQueue::replay(store.load_job_records().unwrap());
        assert_eq!(replayed.pending_len(), 2);
        assert!(replayed.active().is_none());
        assert!(replayed.has_live("ore_mine"));
        assert!(replayed.has_live("tunnel_mine"));
        assert!(!replayed.has_live("refuel"));
    }

    #[test]
    fn yield_keeps_attempts_and_moves_to_tail() {
        let (_dir, store) = test_store();
        let mut queue = JobQueue::default();
        queue
            .enqueue(
                &store,
                JobKind::TunnelMine {
                    tunnel_id: TunnelId::from_index(1),
                },
            )
            .unwrap();
        queue.pop(&store).unwrap();
        queue.yield_active(&store).unwrap();
        queue.enqueue(&store, JobKind::Refuel).unwrap();
        let next = queue.pop(&store).unwrap().unwrap();
        assert_eq!(next.kind.label(), "refuel");
        assert_eq!(next.attempts, 0);
    }
}
