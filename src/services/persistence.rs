//! Durable job records.
//!
//! The chunk loop writes the job (cursor plus per-file and job-level state)
//! after every chunk, so whatever kills the process between two chunks
//! costs at most one chunk of rework. A store never lets a finished job be
//! overwritten: `save` on a terminal row is refused and reported as `false`.

#![allow(async_fn_in_trait)]

use crate::{
    errors::{TransferError, TransferResult},
    models::{
        cursor::ChunkCursor,
        job::{JobStatus, TransferJob},
    },
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::{debug, info};
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

pub trait Persistence {
    /// Store a brand-new job.
    async fn insert(&self, job: &TransferJob) -> TransferResult<()>;

    async fn load(&self, id: Uuid) -> TransferResult<Option<TransferJob>>;

    /// Overwrite the stored job. Returns `false` without writing when the
    /// stored row is already terminal.
    async fn save(&self, job: &TransferJob) -> TransferResult<bool>;

    /// Most recently created job for `destination`.
    async fn latest_for_destination(&self, destination: &str) -> TransferResult<Option<TransferJob>>;

    /// Resume point of a job.
    async fn load_cursor(&self, id: Uuid) -> TransferResult<ChunkCursor> {
        self.load(id)
            .await?
            .map(|job| job.cursor)
            .ok_or(TransferError::JobNotFound(id))
    }
}

/// In-process store. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<HashMap<Uuid, (u64, TransferJob)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, (u64, TransferJob)>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persistence for MemoryStore {
    async fn insert(&self, job: &TransferJob) -> TransferResult<()> {
        let mut jobs = self.lock();
        let seq = jobs.len() as u64;
        jobs.insert(job.id, (seq, job.clone()));
        Ok(())
    }

    async fn load(&self, id: Uuid) -> TransferResult<Option<TransferJob>> {
        Ok(self.lock().get(&id).map(|(_, job)| job.clone()))
    }

    async fn save(&self, job: &TransferJob) -> TransferResult<bool> {
        let mut jobs = self.lock();
        match jobs.get_mut(&job.id) {
            Some((_, stored)) if stored.is_terminal() => Ok(false),
            Some((_, stored)) => {
                *stored = job.clone();
                Ok(true)
            }
            None => Err(TransferError::JobNotFound(job.id)),
        }
    }

    async fn latest_for_destination(&self, destination: &str) -> TransferResult<Option<TransferJob>> {
        Ok(self
            .lock()
            .values()
            .filter(|(_, job)| job.destination == destination)
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, job)| job.clone()))
    }
}

/// Row shape of `transfer_jobs`.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    destination: String,
    status: String,
    failure_count: i64,
    progress: f64,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    is_processing: bool,
    entry_index: i64,
    byte_offset: i64,
    plan: String,
    per_file: String,
    persistent: String,
}

impl TryFrom<JobRow> for TransferJob {
    type Error = TransferError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|err| TransferError::protocol(format!("stored job id `{}`: {err}", row.id)))?;
        Ok(Self {
            id,
            destination: row.destination,
            status: row.status.parse::<JobStatus>()?,
            failure_count: u32::try_from(row.failure_count).unwrap_or(u32::MAX),
            progress_percent: row.progress,
            started_at: row.started_at,
            stopped_at: row.stopped_at,
            last_error: row.last_error,
            plan: serde_json::from_str(&row.plan)?,
            cursor: ChunkCursor {
                is_processing: row.is_processing,
                index: usize::try_from(row.entry_index).unwrap_or(0),
                offset: u64::try_from(row.byte_offset).unwrap_or(0),
            },
            per_file: serde_json::from_str(&row.per_file)?,
            persistent: serde_json::from_str(&row.persistent)?,
        })
    }
}

const SELECT_JOB: &str = "SELECT id, destination, status, failure_count, progress, started_at,
        stopped_at, last_error, is_processing, entry_index, byte_offset, plan, per_file,
        persistent
     FROM transfer_jobs";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the database behind `database_url`.
    pub async fn connect(database_url: &str) -> TransferResult<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        let in_memory = db_path.starts_with(":memory:");

        if !in_memory {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    info!("Created missing directory {:?}", parent);
                }
            }
            // SQLx will not create the file itself without `mode=rwc`.
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(db_path)?;
        }

        // A pool of in-memory connections would be a pool of separate databases.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        debug!(database_url, "connected");
        Ok(Self::new(Arc::new(pool)))
    }

    /// Apply the embedded schema, statement by statement.
    pub async fn migrate(&self) -> TransferResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Every job, newest first.
    pub async fn list_jobs(&self) -> TransferResult<Vec<TransferJob>> {
        let rows: Vec<JobRow> =
            sqlx::query_as(&format!("{SELECT_JOB} ORDER BY created_at DESC, rowid DESC"))
                .fetch_all(&*self.db)
                .await?;
        rows.into_iter().map(TransferJob::try_from).collect()
    }
}

impl Persistence for SqliteStore {
    async fn insert(&self, job: &TransferJob) -> TransferResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO transfer_jobs (
                id, destination, status, failure_count, progress, started_at, stopped_at,
                last_error, is_processing, entry_index, byte_offset, plan, per_file,
                persistent, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.destination)
        .bind(job.status.as_str())
        .bind(i64::from(job.failure_count))
        .bind(job.progress_percent)
        .bind(job.started_at)
        .bind(job.stopped_at)
        .bind(&job.last_error)
        .bind(job.cursor.is_processing)
        .bind(job.cursor.index as i64)
        .bind(job.cursor.offset as i64)
        .bind(serde_json::to_string(&job.plan)?)
        .bind(serde_json::to_string(&job.per_file)?)
        .bind(serde_json::to_string(&job.persistent)?)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> TransferResult<Option<TransferJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!("{SELECT_JOB} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&*self.db)
            .await?;
        row.map(TransferJob::try_from).transpose()
    }

    async fn save(&self, job: &TransferJob) -> TransferResult<bool> {
        let result = sqlx::query(
            "UPDATE transfer_jobs SET
                destination = ?, status = ?, failure_count = ?, progress = ?,
                started_at = ?, stopped_at = ?, last_error = ?, is_processing = ?,
                entry_index = ?, byte_offset = ?, plan = ?, per_file = ?,
                persistent = ?, updated_at = ?
             WHERE id = ? AND status NOT IN ('succeeded', 'failed', 'cancelled')",
        )
        .bind(&job.destination)
        .bind(job.status.as_str())
        .bind(i64::from(job.failure_count))
        .bind(job.progress_percent)
        .bind(job.started_at)
        .bind(job.stopped_at)
        .bind(&job.last_error)
        .bind(job.cursor.is_processing)
        .bind(job.cursor.index as i64)
        .bind(job.cursor.offset as i64)
        .bind(serde_json::to_string(&job.plan)?)
        .bind(serde_json::to_string(&job.per_file)?)
        .bind(serde_json::to_string(&job.persistent)?)
        .bind(Utc::now())
        .bind(job.id.to_string())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.load(job.id).await? {
            Some(_) => Ok(false),
            None => Err(TransferError::JobNotFound(job.id)),
        }
    }

    async fn latest_for_destination(&self, destination: &str) -> TransferResult<Option<TransferJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "{SELECT_JOB} WHERE destination = ? ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(destination)
        .fetch_optional(&*self.db)
        .await?;
        row.map(TransferJob::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        entry::{EntryRole, TransferEntry, TransferPlan},
        multipart::MultipartSession,
    };
    use std::collections::BTreeMap;

    fn job(dest: &str) -> TransferJob {
        TransferJob::new(
            dest,
            TransferPlan::upload(vec![TransferEntry::file(
                "/backups/site.zip",
                "site.zip",
                EntryRole::Archive,
            )]),
        )
        .with_description("nightly")
    }

    async fn sqlite() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn sqlite_round_trips_every_field() {
        let store = sqlite().await;
        let mut job = job("remote");
        store.insert(&job).await.unwrap();

        job.start(Utc::now()).unwrap();
        job.cursor = ChunkCursor {
            is_processing: true,
            index: 0,
            offset: 20,
        };
        let mut session = MultipartSession::new("sess-1", "site.zip", BTreeMap::from([(3, "u3".into())]));
        session.record_part(1, "e1").unwrap();
        session.record_part(2, "e2").unwrap();
        job.persistent.multipart = Some(session);
        job.record_failure("timeout", 10, Utc::now());
        job.set_progress(42.5);
        assert!(store.save(&job).await.unwrap());

        let loaded = store.load(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.cursor, job.cursor);
        assert_eq!(loaded.persistent, job.persistent);
        assert_eq!(loaded.failure_count, 1);
        assert_eq!(loaded.progress_percent, 42.5);
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
        assert_eq!(store.load_cursor(job.id).await.unwrap().offset, 20);
    }

    #[tokio::test]
    async fn sqlite_refuses_to_revive_terminal_jobs() {
        let store = sqlite().await;
        let mut job = job("remote");
        store.insert(&job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled.cancel(Utc::now());
        assert!(store.save(&cancelled).await.unwrap());

        job.start(Utc::now()).unwrap();
        job.cursor.offset = 99;
        assert!(!store.save(&job).await.unwrap());
        let stored = store.load(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.cursor.offset, 0);
    }

    #[tokio::test]
    async fn sqlite_latest_for_destination() {
        let store = sqlite().await;
        let first = job("remote");
        store.insert(&first).await.unwrap();
        let second = job("remote");
        store.insert(&second).await.unwrap();
        store.insert(&job("other")).await.unwrap();

        let latest = store.latest_for_destination("remote").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(store.list_jobs().await.unwrap().len(), 3);
        assert!(store.latest_for_destination("none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_save_of_unknown_job_errors() {
        let store = sqlite().await;
        let err = store.save(&job("remote")).await.unwrap_err();
        assert!(matches!(err, TransferError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn memory_store_matches_sqlite_semantics() {
        let store = MemoryStore::new();
        let mut job = job("remote");
        store.insert(&job).await.unwrap();
        job.start(Utc::now()).unwrap();
        assert!(store.save(&job).await.unwrap());

        let mut failed = job.clone();
        failed.fail("bad name", Utc::now());
        assert!(store.save(&failed).await.unwrap());
        assert!(!store.save(&job).await.unwrap());
        assert_eq!(store.load(job.id).await.unwrap().unwrap().status, JobStatus::Failed);

        let newer = self::job("remote");
        store.insert(&newer).await.unwrap();
        assert_eq!(store.latest_for_destination("remote").await.unwrap().unwrap().id, newer.id);
        assert!(store.load_cursor(Uuid::new_v4()).await.is_err());
    }
}
