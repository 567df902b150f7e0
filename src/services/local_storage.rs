//! LocalStorage: the storage adapter contract on a plain directory.
//!
//! Objects are files under `base_path/{name}`; nested names map to nested
//! directories. An upload in progress is written to `{name}.partial` and
//! renamed into place once its last byte lands, so `name` only ever exists
//! when complete.

use crate::{
    errors::{TransferError, TransferResult},
    models::job::{JobState, PerFileState},
    services::{
        clock::Clock,
        storage::{ChunkSpec, Deadline, StorageAdapter, open_for_resume, read_chunk, write_durable},
    },
};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::debug;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Clone)]
pub struct LocalStorage {
    /// Root directory every object name is resolved under.
    pub base_path: PathBuf,

    /// Bytes moved per read/write step inside one call.
    pub block_size: u64,

    clock: Arc<dyn Clock>,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>, block_size: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_path: base_path.into(),
            block_size: block_size.max(1),
            clock,
        }
    }

    /// Reject names that could escape `base_path`.
    fn ensure_key_safe(&self, key: &str) -> TransferResult<()> {
        let invalid = |reason: &str| TransferError::validation(format!("invalid object name `{key}`: {reason}"));
        if key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid("too long"));
        }
        if key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
            return Err(invalid("must be relative and stay inside the storage root"));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid("contains control characters"));
        }
        Ok(())
    }

    fn object_path(&self, key: &str) -> TransferResult<PathBuf> {
        self.ensure_key_safe(key)?;
        Ok(self.base_path.join(key))
    }

    fn partial_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(PARTIAL_SUFFIX);
        path.with_file_name(name)
    }

    /// Remove empty directories from `start` up to (not including) the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Move bytes from `reader_path` into `file` block by block until
    /// `limit` bytes are moved or the deadline passes.
    async fn pump(
        &self,
        reader_path: &Path,
        file: &mut fs::File,
        offset: u64,
        limit: u64,
        deadline: &Deadline,
    ) -> TransferResult<u64> {
        let mut moved = 0u64;
        while moved < limit {
            let want = self.block_size.min(limit - moved);
            let data = read_chunk(reader_path, offset + moved, want).await?;
            if data.is_empty() {
                break;
            }
            write_durable(file, &data).await?;
            moved += data.len() as u64;
            if deadline.expired() {
                break;
            }
        }
        Ok(moved)
    }
}

impl StorageAdapter for LocalStorage {
    async fn copy_to_storage(
        &self,
        source: &Path,
        dest: &str,
        chunk: ChunkSpec,
        _per_file: &mut PerFileState,
        _job: &mut JobState,
    ) -> TransferResult<u64> {
        let target = self.object_path(dest)?;
        let size = fs::metadata(source).await?.len();

        if fs::metadata(&target).await.map(|m| m.is_file()).unwrap_or(false) {
            debug!(dest, "already present, skipping");
            return Ok(size.saturating_sub(chunk.offset));
        }

        let partial = Self::partial_path(&target);
        let deadline = Deadline::start(self.clock.clone(), chunk.budget);
        let remaining = size.saturating_sub(chunk.offset);
        let limit = chunk.length.map_or(remaining, |len| len.min(remaining));

        let mut file = open_for_resume(&partial, chunk.offset).await?;
        let moved = self
            .pump(source, &mut file, chunk.offset, limit, &deadline)
            .await?;
        drop(file);

        if chunk.offset + moved >= size {
            fs::rename(&partial, &target).await?;
            debug!(dest, size, "object complete");
        }
        Ok(moved)
    }

    async fn copy_from_storage(
        &self,
        source: &str,
        dest: &Path,
        chunk: ChunkSpec,
        _per_file: &mut PerFileState,
        _job: &mut JobState,
    ) -> TransferResult<u64> {
        let object = self.object_path(source)?;
        let size = match fs::metadata(&object).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TransferError::protocol(format!("object `{source}` not found")));
            }
            Err(err) => return Err(err.into()),
        };

        let deadline = Deadline::start(self.clock.clone(), chunk.budget);
        let remaining = size.saturating_sub(chunk.offset);
        let limit = chunk.length.map_or(remaining, |len| len.min(remaining));

        let mut file = open_for_resume(dest, chunk.offset).await?;
        self.pump(&object, &mut file, chunk.offset, limit, &deadline)
            .await
    }

    async fn is_file(&self, name: &str) -> TransferResult<bool> {
        let path = self.object_path(name)?;
        Ok(fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false))
    }

    async fn is_dir(&self, name: &str) -> TransferResult<bool> {
        let path = self.object_path(name)?;
        Ok(fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn file_size(&self, name: &str) -> TransferResult<Option<u64>> {
        let path = self.object_path(name)?;
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Sorted entry names directly under `name`, partial uploads excluded.
    async fn scan_dir(&self, name: &str) -> TransferResult<Vec<String>> {
        let path = self.object_path(name)?;
        let mut dir = fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            if !entry_name.ends_with(PARTIAL_SUFFIX) {
                names.push(entry_name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> TransferResult<()> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} already missing", path.display());
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn create_dir(&self, name: &str) -> TransferResult<()> {
        let path = self.object_path(name)?;
        fs::create_dir_all(path).await?;
        Ok(())
    }
}
