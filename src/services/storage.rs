//! The storage adapter contract the chunk loop drives.
//!
//! Every operation takes explicit offset/length/budget arguments so the same
//! contract serves local disk and the remote backend. Failures come back as
//! `Err(TransferError)`; adapters never panic across this boundary, so the
//! chunk loop has exactly one failure signal.

#![allow(async_fn_in_trait)]

use crate::{
    errors::TransferResult,
    models::job::{JobState, PerFileState},
    services::clock::Clock,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::{self, SeekFrom},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use uuid::Uuid;

/// One slice of a copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Byte offset to start from.
    pub offset: u64,

    /// Bytes to move, `None` for the whole remainder.
    pub length: Option<u64>,

    /// Wall-clock budget for this call only. `Duration::ZERO` = no budget.
    pub budget: Duration,
}

impl ChunkSpec {
    /// Everything from `offset` to the end, no budget.
    pub fn whole(offset: u64) -> Self {
        Self {
            offset,
            length: None,
            budget: Duration::ZERO,
        }
    }
}

/// Why a job is letting go of remote resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseReason {
    Failed,
    Cancelled,
}

pub trait StorageAdapter {
    /// Copy `[offset, offset+length)` of the local `source` into the object
    /// `dest`.
    ///
    /// If `dest` already exists, returns `source_size - offset` without
    /// moving anything. Otherwise returns the bytes actually advanced, which
    /// may be less than asked for when the budget runs out.
    async fn copy_to_storage(
        &self,
        source: &Path,
        dest: &str,
        chunk: ChunkSpec,
        per_file: &mut PerFileState,
        job: &mut JobState,
    ) -> TransferResult<u64>;

    /// Copy a byte range of the object `source` into the local file `dest`
    /// at the same offset. Only the tail from `offset` on is truncated.
    async fn copy_from_storage(
        &self,
        source: &str,
        dest: &Path,
        chunk: ChunkSpec,
        per_file: &mut PerFileState,
        job: &mut JobState,
    ) -> TransferResult<u64>;

    async fn is_file(&self, name: &str) -> TransferResult<bool>;

    async fn is_dir(&self, name: &str) -> TransferResult<bool>;

    /// Size of the object, `None` if it does not exist.
    async fn file_size(&self, name: &str) -> TransferResult<Option<u64>>;

    async fn scan_dir(&self, name: &str) -> TransferResult<Vec<String>>;

    async fn delete(&self, name: &str) -> TransferResult<()>;

    async fn create_dir(&self, name: &str) -> TransferResult<()>;

    /// Called once before each pass of an upload that has not moved any
    /// byte yet.
    async fn prepare_upload(&self, _total_bytes: u64) -> TransferResult<()> {
        Ok(())
    }

    /// Let go of anything the job holds at the backend.
    async fn release(
        &self,
        _job_id: Uuid,
        _per_file: &mut PerFileState,
        _job: &mut JobState,
        _reason: ReleaseReason,
    ) -> TransferResult<()> {
        Ok(())
    }
}

/// Wall-clock budget started at construction.
pub struct Deadline {
    clock: Arc<dyn Clock>,
    started: DateTime<Utc>,
    budget: Duration,
}

impl Deadline {
    pub fn start(clock: Arc<dyn Clock>, budget: Duration) -> Self {
        let started = clock.now();
        Self {
            clock,
            started,
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        (self.clock.now() - self.started).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_unbounded(&self) -> bool {
        self.budget.is_zero()
    }

    pub fn expired(&self) -> bool {
        !self.is_unbounded() && self.elapsed() >= self.budget
    }

    /// Budget left, `Duration::ZERO` when unbounded.
    pub fn remaining(&self) -> Duration {
        if self.is_unbounded() {
            Duration::ZERO
        } else {
            self.budget.saturating_sub(self.elapsed())
        }
    }
}

/// Read up to `len` bytes of `path` starting at `offset`.
pub async fn read_chunk(path: &Path, offset: u64, len: u64) -> TransferResult<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Open `path` for a resumed write at `offset`: create it (and its parents)
/// if needed, drop anything past `offset`, and position the cursor there.
pub async fn open_for_resume(path: &Path, offset: u64) -> TransferResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    let current = file.metadata().await?.len();
    if current < offset {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "{} has {} bytes, cannot resume at {}",
                path.display(),
                current,
                offset
            ),
        )
        .into());
    }
    if current > offset {
        file.set_len(offset).await?;
    }
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Write and make durable.
pub async fn write_durable(file: &mut File, data: &[u8]) -> TransferResult<()> {
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Hex MD5 of a whole file, streamed.
pub async fn file_md5(path: &Path) -> TransferResult<md5::Digest> {
    let mut file = File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(ctx.compute())
}
