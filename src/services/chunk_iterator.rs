//! One bounded-time pass over a job's transfer plan.
//!
//! The pass moves one chunk at a time through a [`StorageAdapter`] and
//! writes the job back to the [`Persistence`] store after every chunk. A
//! failed chunk leaves the cursor where it was and ends the pass with the
//! error; deciding what that failure means for the job is the runner's
//! business.

use crate::{
    errors::{TransferError, TransferResult},
    models::{
        entry::{Direction, EntryRole, TransferEntry, TransferPlan},
        job::{PerFileState, TransferJob},
    },
    services::{
        clock::Clock,
        persistence::Persistence,
        storage::{ChunkSpec, Deadline, StorageAdapter},
    },
};
use std::{sync::Arc, time::Duration};
use tokio::fs;
use tracing::{debug, info, warn};

/// Why a pass stopped without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every entry of the plan has been moved.
    Finished,
    /// The budget ran out with entries left.
    BudgetExhausted,
    /// The stored job turned terminal under us.
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassReport {
    pub outcome: PassOutcome,
    pub bytes_moved: u64,
    pub chunks: u32,
}

pub struct ChunkIterator<'a, S, P> {
    storage: &'a S,
    store: &'a P,
    clock: Arc<dyn Clock>,

    /// Nominal bytes requested per adapter call.
    chunk_size: u64,

    /// Wall-clock budget for the whole pass. `Duration::ZERO` = none.
    budget: Duration,
}

impl<'a, S, P> ChunkIterator<'a, S, P>
where
    S: StorageAdapter,
    P: Persistence,
{
    pub fn new(
        storage: &'a S,
        store: &'a P,
        clock: Arc<dyn Clock>,
        chunk_size: u64,
        budget: Duration,
    ) -> Self {
        Self {
            storage,
            store,
            clock,
            chunk_size: chunk_size.max(1),
            budget,
        }
    }

    /// Walk the plan from the job's cursor until it is exhausted or the
    /// budget runs out.
    ///
    /// The job is saved after every chunk. On `Err` the cursor is untouched
    /// but adapter state (recorded parts, session ids) may have changed, so
    /// the caller should still save it.
    pub async fn run_pass(&self, job: &mut TransferJob) -> TransferResult<PassReport> {
        let deadline = Deadline::start(self.clock.clone(), self.budget);
        let entries = job.plan.entries.len();
        let mut report = PassReport {
            outcome: PassOutcome::Finished,
            bytes_moved: 0,
            chunks: 0,
        };

        info!(
            job_id = %job.id,
            index = job.cursor.index,
            offset = job.cursor.offset,
            budget_secs = self.budget.as_secs_f64(),
            "pass started"
        );

        if !job.cursor.is_exhausted(entries) && !job.cursor.is_processing {
            job.cursor.is_processing = true;
            if !self.store.save(job).await? {
                report.outcome = PassOutcome::Cancelled;
                return Ok(report);
            }
        }

        while !job.cursor.is_exhausted(entries) {
            if report.chunks > 0 && deadline.expired() {
                report.outcome = PassOutcome::BudgetExhausted;
                break;
            }
            if self.cancelled_elsewhere(job).await? {
                report.outcome = PassOutcome::Cancelled;
                break;
            }

            let entry = job.plan.entries[job.cursor.index].clone();
            let moved = if entry.is_dir {
                self.make_dir(&job.plan, &entry).await?;
                self.finish_entry(job, &entry);
                0
            } else {
                self.copy_chunk(job, &entry, &deadline).await?
            };

            report.bytes_moved += moved;
            report.chunks += 1;
            job.set_progress(progress_percent(&job.plan, job.cursor.index, job.cursor.offset, job.per_file.size));

            if job.cursor.is_exhausted(entries) {
                job.cursor.is_processing = false;
            }
            if !self.store.save(job).await? {
                report.outcome = PassOutcome::Cancelled;
                break;
            }
        }

        info!(
            job_id = %job.id,
            outcome = ?report.outcome,
            bytes = report.bytes_moved,
            chunks = report.chunks,
            "pass stopped"
        );
        Ok(report)
    }

    /// One adapter call for the current file entry.
    async fn copy_chunk(
        &self,
        job: &mut TransferJob,
        entry: &TransferEntry,
        deadline: &Deadline,
    ) -> TransferResult<u64> {
        let direction = job.plan.direction;
        let size = match job.per_file.size {
            Some(size) => size,
            None => {
                let size = self.source_size(direction, entry).await?;
                job.per_file.size = Some(size);
                size
            }
        };

        let offset = job.cursor.offset;
        if offset > size {
            return Err(TransferError::protocol(format!(
                "{} shrank below the resume offset {offset}",
                entry.local.display()
            )));
        }

        let chunk = ChunkSpec {
            offset,
            length: Some(self.chunk_size),
            budget: deadline.remaining(),
        };
        if !deadline.is_unbounded() && chunk.budget.is_zero() {
            return Ok(0);
        }

        let moved = if offset == size && size > 0 {
            0
        } else {
            match direction {
                Direction::Upload => {
                    self.storage
                        .copy_to_storage(&entry.local, &entry.remote, chunk, &mut job.per_file, &mut job.persistent)
                        .await?
                }
                Direction::Download => {
                    self.storage
                        .copy_from_storage(&entry.remote, &entry.local, chunk, &mut job.per_file, &mut job.persistent)
                        .await?
                }
            }
        };

        job.cursor.advance(moved);
        debug!(remote = %entry.remote, offset = job.cursor.offset, size, moved, "chunk moved");

        if job.cursor.offset >= size {
            self.finish_entry(job, entry);
        } else if moved == 0 {
            return Err(TransferError::protocol(format!(
                "no progress on {} at offset {offset}",
                entry.remote
            )));
        }
        Ok(moved)
    }

    async fn source_size(&self, direction: Direction, entry: &TransferEntry) -> TransferResult<u64> {
        match direction {
            Direction::Upload => Ok(fs::metadata(&entry.local).await?.len()),
            Direction::Download => self
                .storage
                .file_size(&entry.remote)
                .await?
                .ok_or_else(|| TransferError::protocol(format!("{} is not at the backend", entry.remote))),
        }
    }

    async fn make_dir(&self, plan: &TransferPlan, entry: &TransferEntry) -> TransferResult<()> {
        match plan.direction {
            Direction::Upload => self.storage.create_dir(&entry.remote).await,
            Direction::Download => Ok(fs::create_dir_all(&entry.local).await?),
        }
    }

    /// Mark the current entry done and move the cursor on.
    fn finish_entry(&self, job: &mut TransferJob, entry: &TransferEntry) {
        match entry.role {
            EntryRole::Archive => job.persistent.archive_done = true,
            EntryRole::SideChannel => job.persistent.side_file_done = true,
            EntryRole::Plain => {}
        }
        job.per_file = PerFileState::default();
        job.cursor.next_entry();
        debug!(job_id = %job.id, remote = %entry.remote, "entry done");
    }

    async fn cancelled_elsewhere(&self, job: &TransferJob) -> TransferResult<bool> {
        match self.store.load(job.id).await? {
            Some(stored) if stored.is_terminal() => {
                warn!(job_id = %job.id, status = %stored.status, "job finished elsewhere, stopping");
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(TransferError::JobNotFound(job.id)),
        }
    }
}

/// Entry-weighted progress: each entry counts the same, the current one
/// by the fraction of its bytes moved.
fn progress_percent(plan: &TransferPlan, index: usize, offset: u64, size: Option<u64>) -> f64 {
    let total = plan.entries.len();
    if total == 0 || index >= total {
        return 100.0;
    }
    let within = match size {
        Some(size) if size > 0 => offset as f64 / size as f64,
        _ => 0.0,
    };
    (index as f64 + within.min(1.0)) / total as f64 * 100.0
}

/// Sum of the local file sizes of an upload plan.
pub async fn local_plan_bytes(plan: &TransferPlan) -> TransferResult<u64> {
    let mut total = 0u64;
    for entry in plan.entries.iter().filter(|e| !e.is_dir) {
        total += fs::metadata(&entry.local).await?.len();
    }
    Ok(total)
}
