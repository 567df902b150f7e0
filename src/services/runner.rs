//! Drives transfer jobs one bounded pass at a time.
//!
//! Each `tick` is one invocation of the external driver: load the job,
//! start it if needed, run one pass, fold the result into the job's state
//! machine and write it back. Callers must not tick the same job from two
//! places at once; the store's refusal to overwrite a finished job is the
//! only guard against a cancel racing a pass.

use crate::{
    errors::{TransferError, TransferResult},
    models::{
        entry::{Direction, TransferPlan},
        job::{JobStatus, TransferJob},
    },
    services::{
        chunk_iterator::{ChunkIterator, PassOutcome, local_plan_bytes},
        clock::Clock,
        persistence::Persistence,
        storage::{ReleaseReason, StorageAdapter},
    },
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug)]
pub struct RunnerConfig {
    pub chunk_size: u64,
    /// Per-tick wall-clock budget. `Duration::ZERO` = run to completion.
    pub budget: Duration,
    /// Failures tolerated before the job moves to Failed.
    pub max_failures: u32,
}

/// What a single tick did to the job.
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Budget ran out with work left; tick again.
    Progressed { bytes_moved: u64, progress_percent: f64 },
    Succeeded,
    /// Rate limited. Nothing was charged to the failure budget.
    Deferred { retry_after: Duration },
    /// A chunk failed and was charged; the job keeps running.
    Retry { failure_count: u32, error: String },
    Failed { error: String },
    /// The job was already finished, or finished elsewhere mid-tick.
    Halted(JobStatus),
}

pub struct TransferRunner<S, P> {
    storage: S,
    store: P,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
}

impl<S, P> TransferRunner<S, P>
where
    S: StorageAdapter,
    P: Persistence,
{
    pub fn new(storage: S, store: P, clock: Arc<dyn Clock>, config: RunnerConfig) -> Self {
        Self {
            storage,
            store,
            clock,
            config,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// Create a job for `destination`, superseding (cancelling) any
    /// unfinished job already targeting it.
    pub async fn submit(
        &self,
        destination: &str,
        plan: TransferPlan,
        description: Option<String>,
    ) -> TransferResult<TransferJob> {
        if plan.entries.is_empty() {
            return Err(TransferError::validation("transfer plan has no entries"));
        }
        if let Some(previous) = self.store.latest_for_destination(destination).await? {
            if !previous.is_terminal() {
                info!(job_id = %previous.id, destination, "superseding unfinished job");
                self.cancel(previous.id).await?;
            }
        }

        let mut job = TransferJob::new(destination, plan);
        job.persistent.description = description;
        self.store.insert(&job).await?;
        info!(job_id = %job.id, destination, direction = ?job.plan.direction, "job created");
        Ok(job)
    }

    pub async fn status(&self, id: Uuid) -> TransferResult<TransferJob> {
        self.store.load(id).await?.ok_or(TransferError::JobNotFound(id))
    }

    /// Run one bounded pass of job `id`.
    pub async fn tick(&self, id: Uuid) -> TransferResult<TickOutcome> {
        let mut job = self.status(id).await?;
        if job.is_terminal() {
            return Ok(TickOutcome::Halted(job.status));
        }

        if job.status == JobStatus::Pending {
            job.start(self.clock.now())?;
            info!(job_id = %job.id, destination = %job.destination, "job started");
            if !self.store.save(&job).await? {
                return self.halted(id).await;
            }
        }

        let result = self.pass(&mut job).await;
        let now = self.clock.now();
        let outcome = match result {
            Ok((PassOutcome::Cancelled, _)) => return self.halted(id).await,
            Ok((PassOutcome::BudgetExhausted, bytes_moved)) => TickOutcome::Progressed {
                bytes_moved,
                progress_percent: job.progress_percent,
            },
            Ok((PassOutcome::Finished, bytes_moved)) => {
                if job.complete_if_done(now) {
                    info!(job_id = %job.id, "job succeeded");
                    TickOutcome::Succeeded
                } else {
                    TickOutcome::Progressed {
                        bytes_moved,
                        progress_percent: job.progress_percent,
                    }
                }
            }
            Err(err) if !err.counts_against_budget() => {
                let retry_after = match &err {
                    TransferError::RateLimited { retry_after } => *retry_after,
                    _ => Duration::ZERO,
                };
                info!(job_id = %job.id, retry_after_secs = retry_after.as_secs(), "deferred by rate limit");
                job.last_error = Some(err.to_string());
                TickOutcome::Deferred { retry_after }
            }
            Err(err) if err.is_fatal() => {
                warn!(job_id = %job.id, error = %err, "job failed");
                job.fail(err.to_string(), now);
                self.release(&mut job, ReleaseReason::Failed).await;
                TickOutcome::Failed {
                    error: err.to_string(),
                }
            }
            Err(err) => {
                let status = job.record_failure(err.to_string(), self.config.max_failures, now);
                if status == JobStatus::Failed {
                    warn!(job_id = %job.id, failures = job.failure_count, error = %err, "failure budget spent, job failed");
                    self.release(&mut job, ReleaseReason::Failed).await;
                    TickOutcome::Failed {
                        error: err.to_string(),
                    }
                } else {
                    warn!(job_id = %job.id, failures = job.failure_count, error = %err, "chunk failed");
                    TickOutcome::Retry {
                        failure_count: job.failure_count,
                        error: err.to_string(),
                    }
                }
            }
        };

        if !self.store.save(&job).await? {
            return self.halted(id).await;
        }
        Ok(outcome)
    }

    /// Tick until the job leaves Running or `max_ticks` is reached.
    pub async fn run_to_end(&self, id: Uuid, max_ticks: u32) -> TransferResult<TickOutcome> {
        let mut last = TickOutcome::Halted(JobStatus::Pending);
        for _ in 0..max_ticks {
            last = self.tick(id).await?;
            match last {
                TickOutcome::Progressed { .. } | TickOutcome::Retry { .. } => continue,
                _ => break,
            }
        }
        Ok(last)
    }

    /// Cancel job `id` and release whatever it holds at the backend.
    /// Returns `false` if the job had already finished.
    pub async fn cancel(&self, id: Uuid) -> TransferResult<bool> {
        let mut job = self.status(id).await?;
        if !job.cancel(self.clock.now()) {
            return Ok(false);
        }
        self.release(&mut job, ReleaseReason::Cancelled).await;
        let saved = self.store.save(&job).await?;
        if saved {
            info!(job_id = %job.id, "job cancelled");
        }
        Ok(saved)
    }

    async fn pass(&self, job: &mut TransferJob) -> TransferResult<(PassOutcome, u64)> {
        if job.plan.direction == Direction::Upload && self.is_fresh_upload(job) {
            let total = local_plan_bytes(&job.plan).await?;
            self.storage.prepare_upload(total).await?;
        }
        let iterator = ChunkIterator::new(
            &self.storage,
            &self.store,
            self.clock.clone(),
            self.config.chunk_size,
            self.config.budget,
        );
        let report = iterator.run_pass(job).await?;
        Ok((report.outcome, report.bytes_moved))
    }

    fn is_fresh_upload(&self, job: &TransferJob) -> bool {
        job.cursor.index == 0
            && job.cursor.offset == 0
            && job.persistent.multipart.is_none()
            && job.per_file.upload_id.is_none()
    }

    /// Best effort: a release that fails is logged, not surfaced.
    async fn release(&self, job: &mut TransferJob, reason: ReleaseReason) {
        if let Err(err) = self
            .storage
            .release(job.id, &mut job.per_file, &mut job.persistent, reason)
            .await
        {
            warn!(job_id = %job.id, ?reason, error = %err, "failed to release backend resources");
        }
    }

    async fn halted(&self, id: Uuid) -> TransferResult<TickOutcome> {
        let status = self.status(id).await?.status;
        Ok(TickOutcome::Halted(status))
    }
}
