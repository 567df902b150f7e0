//! RemoteStorage: the storage adapter contract over the backup backend.
//!
//! The backend exposes one flat namespace of archive-named objects, so
//! directories are virtual: the root is the only directory and creating one
//! is a no-op.
//!
//! Upload policy per call:
//! - object already present and no session open: skip ahead, nothing sent;
//! - non-archive name (side-channel files): one `direct_upload`;
//! - empty file, or no budget with the whole remainder requested from
//!   offset 0: single-shot `start-upload` / PUT / `complete-upload`;
//! - otherwise: whole parts of `part_size` through a multipart session,
//!   completed once the source is exhausted.

use crate::{
    errors::{TransferError, TransferResult},
    models::job::{JobState, PerFileState},
    services::{
        clock::Clock,
        storage::{
            ChunkSpec, Deadline, ReleaseReason, StorageAdapter, file_md5, open_for_resume,
            read_chunk, write_durable,
        },
        transfer_client::{TransferClient, ensure_object_name, is_archive_name},
    },
};
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use std::{path::Path, sync::Arc};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct RemoteStorage {
    client: TransferClient,
    clock: Arc<dyn Clock>,

    /// Size of every multipart part except the last.
    part_size: u64,

    /// Retention applied by the backend when an upload completes.
    max_backups: u32,
}

impl RemoteStorage {
    pub fn new(client: TransferClient, clock: Arc<dyn Clock>, part_size: u64, max_backups: u32) -> Self {
        Self {
            client,
            clock,
            part_size: part_size.max(1),
            max_backups,
        }
    }

    pub fn client(&self) -> &TransferClient {
        &self.client
    }

    async fn single_shot(
        &self,
        source: &Path,
        dest: &str,
        size: u64,
        per_file: &mut PerFileState,
        job: &JobState,
    ) -> TransferResult<()> {
        if let Some(stale) = per_file.upload_id.clone() {
            self.release_stale_upload(&stale, job).await?;
            per_file.upload_id = None;
        }

        let digest = file_md5(source).await?;
        let checksum = format!("{digest:x}");

        let ticket = self
            .client
            .start_upload(dest, size, job.description.as_deref())
            .await?;
        per_file.upload_id = Some(ticket.upload_id.clone());

        let file = fs::File::open(source).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let content_md5 = general_purpose::STANDARD.encode(digest.0);
        if let Some(remote) = self.client.put_presigned(&ticket.url, body, &content_md5).await? {
            if remote != checksum {
                return Err(TransferError::protocol(format!(
                    "upload of {dest} ETag mismatch: local {checksum}, backend {remote}"
                )));
            }
        }

        self.client
            .complete_upload(&ticket.upload_id, &checksum, self.max_backups)
            .await?;
        per_file.upload_id = None;
        Ok(())
    }

    /// A ticket left by an attempt that failed after `start-upload` still
    /// holds backend capacity; hand it back before opening another.
    async fn release_stale_upload(&self, upload_id: &str, job: &JobState) -> TransferResult<()> {
        match job.job_id {
            Some(job_id) => {
                self.client.fail_upload(upload_id, &job_id.to_string()).await?;
                info!(upload_id, "released stale single-shot upload");
            }
            None => warn!(upload_id, "no job id recorded, cannot release stale upload"),
        }
        Ok(())
    }

    async fn multipart(
        &self,
        source: &Path,
        dest: &str,
        size: u64,
        chunk: ChunkSpec,
        job: &mut JobState,
    ) -> TransferResult<u64> {
        if chunk.offset > size {
            return Err(TransferError::protocol(format!(
                "{} is {size} bytes, cannot resume at {}",
                source.display(),
                chunk.offset
            )));
        }
        if chunk.offset % self.part_size != 0 {
            return Err(TransferError::protocol(format!(
                "offset {} is not aligned to the {}-byte part size",
                chunk.offset, self.part_size
            )));
        }

        if job.multipart.is_none() {
            let session = self
                .client
                .start_multipart(dest, size, job.description.as_deref())
                .await?;
            job.multipart = Some(session);
        }

        let result = self.push_parts(source, size, chunk, job).await;
        if let Err(TransferError::Http { status: 404, .. }) = &result {
            // Completed by a run that stopped before its progress was saved.
            if self.finished_elsewhere(dest, size).await? {
                info!(dest, "session already completed, object in place");
                job.multipart = None;
                return Ok(size - chunk.offset);
            }
        }
        result
    }

    async fn finished_elsewhere(&self, dest: &str, size: u64) -> TransferResult<bool> {
        Ok(self
            .client
            .backup_info(dest)
            .await?
            .is_some_and(|info| info.size == size))
    }

    async fn push_parts(
        &self,
        source: &Path,
        size: u64,
        chunk: ChunkSpec,
        job: &mut JobState,
    ) -> TransferResult<u64> {
        let session = job
            .multipart
            .as_mut()
            .ok_or_else(|| TransferError::protocol("multipart session missing"))?;

        let deadline = Deadline::start(self.clock.clone(), chunk.budget);
        let remaining = size - chunk.offset;
        let limit = chunk.length.map_or(remaining, |len| len.min(remaining));

        let mut moved = 0u64;
        while moved < limit {
            let position = chunk.offset + moved;
            let len = self.part_size.min(size - position);
            let data = read_chunk(source, position, len).await?;
            if data.len() as u64 != len {
                return Err(TransferError::protocol(format!(
                    "{} shrank while uploading",
                    source.display()
                )));
            }
            let part_number = u32::try_from(position / self.part_size + 1)
                .map_err(|_| TransferError::protocol("part number out of range"))?;

            self.client.upload_part(session, part_number, data).await?;
            moved += len;

            if deadline.expired() {
                break;
            }
        }

        if chunk.offset + moved >= size {
            let expected = u32::try_from(size.div_ceil(self.part_size))
                .map_err(|_| TransferError::protocol("part count out of range"))?;
            session.verify_complete(expected)?;
            self.client.complete_multipart(session, self.max_backups).await?;
            job.multipart = None;
        }
        Ok(moved)
    }

    async fn ranged_download(
        &self,
        source: &str,
        dest: &Path,
        chunk: ChunkSpec,
        per_file: &mut PerFileState,
        size: u64,
    ) -> TransferResult<u64> {
        let deadline = Deadline::start(self.clock.clone(), chunk.budget);
        let remaining = size - chunk.offset;
        let limit = chunk.length.map_or(remaining, |len| len.min(remaining));
        let mut file = open_for_resume(dest, chunk.offset).await?;

        let mut moved = 0u64;
        while moved < limit {
            let position = chunk.offset + moved;
            let len = self.part_size.min(limit - moved);
            let url = match per_file.download.as_ref() {
                Some(target) => target.url.clone(),
                None => return Err(TransferError::protocol("download target missing")),
            };
            let data = match self.client.download_range(&url, position, len).await {
                Err(TransferError::Http { status: 403, .. }) => {
                    warn!(source, "download URL expired, refreshing");
                    let target = self.client.download_target(source).await?;
                    let url = target.url.clone();
                    per_file.download = Some(target);
                    self.client.download_range(&url, position, len).await?
                }
                other => other?,
            };
            if data.is_empty() {
                return Err(TransferError::protocol(format!(
                    "empty body for {source} at offset {position}"
                )));
            }
            write_durable(&mut file, &data).await?;
            moved += data.len() as u64;

            if deadline.expired() {
                break;
            }
        }
        Ok(moved)
    }

    async fn whole_download(&self, dest: &Path, url: &str, size: u64) -> TransferResult<u64> {
        let mut file = open_for_resume(dest, 0).await?;
        let resp = self.client.download_whole(url).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        write_durable(&mut file, &[]).await?;
        if written != size {
            return Err(TransferError::protocol(format!(
                "downloaded {written} bytes, expected {size}"
            )));
        }
        Ok(written)
    }
}

impl StorageAdapter for RemoteStorage {
    async fn copy_to_storage(
        &self,
        source: &Path,
        dest: &str,
        chunk: ChunkSpec,
        per_file: &mut PerFileState,
        job: &mut JobState,
    ) -> TransferResult<u64> {
        ensure_object_name(dest)?;
        let size = fs::metadata(source).await?.len();

        if let Some(session) = &job.multipart {
            if session.object_name != dest {
                warn!(
                    session_id = %session.session_id,
                    object = %session.object_name,
                    dest,
                    "dropping multipart session left over from another object"
                );
                job.multipart = None;
            }
        }

        let session_open = job.multipart.is_some() || per_file.upload_id.is_some();
        if !session_open && self.is_file(dest).await? {
            info!(dest, "object already at backend, skipping");
            return Ok(size.saturating_sub(chunk.offset));
        }

        let remaining = size.saturating_sub(chunk.offset);

        if !is_archive_name(dest) {
            let data = read_chunk(source, 0, size).await?;
            self.client.direct_upload(dest, data).await?;
            return Ok(remaining);
        }

        let wants_rest = chunk.length.is_none_or(|len| len >= remaining);
        let fresh = chunk.offset == 0 && job.multipart.is_none();
        if size == 0 || (chunk.budget.is_zero() && wants_rest && fresh) {
            self.single_shot(source, dest, size, per_file, job).await?;
            return Ok(remaining);
        }

        self.multipart(source, dest, size, chunk, job).await
    }

    async fn copy_from_storage(
        &self,
        source: &str,
        dest: &Path,
        chunk: ChunkSpec,
        per_file: &mut PerFileState,
        _job: &mut JobState,
    ) -> TransferResult<u64> {
        let target = match per_file.download.clone() {
            Some(target) => target,
            None => {
                let target = self.client.download_target(source).await?;
                debug!(source, size = target.size, "download target fetched");
                per_file.download = Some(target.clone());
                target
            }
        };

        if chunk.offset >= target.size {
            let file = open_for_resume(dest, target.size).await?;
            drop(file);
            return Ok(0);
        }

        let whole = chunk.budget.is_zero() && chunk.offset == 0 && chunk.length.is_none();
        if whole {
            return self.whole_download(dest, &target.url, target.size).await;
        }
        self.ranged_download(source, dest, chunk, per_file, target.size)
            .await
    }

    async fn is_file(&self, name: &str) -> TransferResult<bool> {
        Ok(self.client.backup_info(name).await?.is_some())
    }

    async fn is_dir(&self, name: &str) -> TransferResult<bool> {
        Ok(name.trim_matches('/').is_empty())
    }

    async fn file_size(&self, name: &str) -> TransferResult<Option<u64>> {
        Ok(self.client.backup_info(name).await?.map(|info| info.size))
    }

    async fn scan_dir(&self, name: &str) -> TransferResult<Vec<String>> {
        if !self.is_dir(name).await? {
            return Err(TransferError::validation(format!(
                "`{name}` is not a directory: the backend namespace is flat"
            )));
        }
        let mut names: Vec<String> = self
            .client
            .list_backups()
            .await?
            .into_iter()
            .map(|b| b.name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> TransferResult<()> {
        self.client.delete_backup(name).await
    }

    async fn create_dir(&self, name: &str) -> TransferResult<()> {
        debug!(name, "flat namespace, nothing to create");
        Ok(())
    }

    /// Check the token and that the backend has room for `total_bytes`.
    async fn prepare_upload(&self, total_bytes: u64) -> TransferResult<()> {
        let quota = self.client.verify_storage().await?;
        if quota.available() < total_bytes {
            return Err(TransferError::InsufficientStorage {
                needed: total_bytes,
                available: quota.available(),
            });
        }
        debug!(available = quota.available(), total_bytes, "storage verified");
        Ok(())
    }

    async fn release(
        &self,
        job_id: Uuid,
        per_file: &mut PerFileState,
        job: &mut JobState,
        reason: ReleaseReason,
    ) -> TransferResult<()> {
        let upload_id = job
            .multipart
            .as_ref()
            .map(|s| s.session_id.clone())
            .or_else(|| per_file.upload_id.clone());
        let Some(upload_id) = upload_id else {
            return Ok(());
        };
        let job_id = job_id.to_string();
        match reason {
            ReleaseReason::Failed => self.client.fail_upload(&upload_id, &job_id).await?,
            ReleaseReason::Cancelled => self.client.cancel_upload(&upload_id, &job_id).await?,
        }
        job.multipart = None;
        per_file.upload_id = None;
        Ok(())
    }
}
