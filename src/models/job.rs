//! The per-destination transfer job and its state machine.

use crate::{
    errors::{TransferError, TransferResult},
    models::{
        backup::DownloadTarget, cursor::ChunkCursor, entry::TransferPlan,
        multipart::MultipartSession,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle of a transfer job.
///
/// `Pending -> Running -> {Succeeded, Failed, Cancelled}`; the last three
/// are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TransferError::protocol(format!("unknown job status `{other}`"))),
        }
    }
}

/// State scoped to the entry currently being moved. Reset whenever the
/// cursor moves on to the next entry.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PerFileState {
    /// Source size captured when the entry was first touched.
    #[serde(default)]
    pub size: Option<u64>,

    /// Id returned by a single-shot `start-upload`.
    #[serde(default)]
    pub upload_id: Option<String>,

    /// Download URL + size, fetched once per file.
    #[serde(default)]
    pub download: Option<DownloadTarget>,
}

/// State that survives across entries for the whole job.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct JobState {
    /// Owning job, sent along with release calls.
    #[serde(default)]
    pub job_id: Option<Uuid>,

    /// Human description attached to the uploaded backup.
    #[serde(default)]
    pub description: Option<String>,

    /// Open multipart session, if any.
    #[serde(default)]
    pub multipart: Option<MultipartSession>,

    #[serde(default)]
    pub archive_done: bool,

    #[serde(default)]
    pub side_file_done: bool,
}

/// One archive's transfer to one destination.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransferJob {
    pub id: Uuid,

    /// Remote destination identifier this job writes to (or reads from).
    pub destination: String,

    pub status: JobStatus,

    /// Adapter-level failures charged so far.
    pub failure_count: u32,

    /// 0.0 ..= 100.0
    pub progress_percent: f64,

    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,

    /// Last failure message surfaced to the caller.
    pub last_error: Option<String>,

    pub plan: TransferPlan,
    pub cursor: ChunkCursor,
    pub per_file: PerFileState,
    pub persistent: JobState,
}

impl TransferJob {
    pub fn new(destination: impl Into<String>, plan: TransferPlan) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            destination: destination.into(),
            status: JobStatus::Pending,
            failure_count: 0,
            progress_percent: 0.0,
            started_at: None,
            stopped_at: None,
            last_error: None,
            plan,
            cursor: ChunkCursor::default(),
            per_file: PerFileState::default(),
            persistent: JobState {
                job_id: Some(id),
                ..JobState::default()
            },
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.persistent.description = Some(description.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending -> Running. A running job stays running; a finished job
    /// refuses.
    pub fn start(&mut self, now: DateTime<Utc>) -> TransferResult<()> {
        match self.status {
            JobStatus::Pending => {
                self.status = JobStatus::Running;
                self.started_at = Some(now);
                Ok(())
            }
            JobStatus::Running => Ok(()),
            _ => Err(TransferError::Terminal(self.id)),
        }
    }

    /// Charge one failure. Moves to Failed once the count exceeds
    /// `max_failures`. No-op on a finished job.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        max_failures: u32,
        now: DateTime<Utc>,
    ) -> JobStatus {
        if self.is_terminal() {
            return self.status;
        }
        self.failure_count += 1;
        self.last_error = Some(message.into());
        if self.failure_count > max_failures {
            self.status = JobStatus::Failed;
            self.stopped_at = Some(now);
        }
        self.status
    }

    /// Cancel from any non-terminal state, regardless of failure count.
    /// Returns whether the status changed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.stopped_at = Some(now);
        true
    }

    /// Fail immediately on an error no retry can fix.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.last_error = Some(message.into());
        self.status = JobStatus::Failed;
        self.stopped_at = Some(now);
        true
    }

    /// Move to Succeeded once the archive and the side-channel file have
    /// both landed. A role the plan does not carry is not waited for.
    pub fn complete_if_done(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let archive_ok = self.persistent.archive_done || !self.plan.has_archive();
        let side_ok = self.persistent.side_file_done || !self.plan.has_side_channel();
        if archive_ok && side_ok {
            self.status = JobStatus::Succeeded;
            self.progress_percent = 100.0;
            self.stopped_at = Some(now);
            return true;
        }
        false
    }

    pub fn set_progress(&mut self, percent: f64) {
        if self.is_terminal() {
            return;
        }
        self.progress_percent = percent.clamp(0.0, 100.0);
    }
}
