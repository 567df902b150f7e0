//! Represents an open multipart upload session and its completed parts.

use crate::errors::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many presigned part URLs are requested (and cached) at a time.
pub const PART_URL_BATCH: u32 = 50;

/// A part the backend has acknowledged.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-based).
    #[serde(rename = "PartNumber")]
    pub part_number: u32,

    /// Lowercase hex MD5 of the part bytes.
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// A multipart upload session, opened before the first part of a large
/// archive is sent.
///
/// Lives in the job's persistent state so the completed-part list survives
/// across process invocations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MultipartSession {
    /// Opaque remote handle.
    pub session_id: String,

    /// Object this session will finalize into.
    pub object_name: String,

    /// Look-ahead window of presigned URLs, at most [`PART_URL_BATCH`].
    #[serde(default)]
    pub part_urls: BTreeMap<u32, String>,

    /// Strictly increasing by part number, no duplicates.
    #[serde(default)]
    pub completed_parts: Vec<CompletedPart>,
}

impl MultipartSession {
    pub fn new(
        session_id: impl Into<String>,
        object_name: impl Into<String>,
        part_urls: BTreeMap<u32, String>,
    ) -> Self {
        let mut session = Self {
            session_id: session_id.into(),
            object_name: object_name.into(),
            part_urls: BTreeMap::new(),
            completed_parts: Vec::new(),
        };
        session.replace_window(part_urls);
        session
    }

    /// Cached presigned URL for `part_number`, if inside the window.
    pub fn url_for(&self, part_number: u32) -> Option<&str> {
        self.part_urls.get(&part_number).map(String::as_str)
    }

    /// Swap in a freshly fetched batch, keeping only the first
    /// [`PART_URL_BATCH`] entries.
    pub fn replace_window(&mut self, urls: BTreeMap<u32, String>) {
        self.part_urls = urls
            .into_iter()
            .take(PART_URL_BATCH as usize)
            .collect();
    }

    /// Record an acknowledged part.
    ///
    /// Re-recording a part number that is already present replaces its ETag
    /// in place; the list stays sorted and duplicate free.
    pub fn record_part(&mut self, part_number: u32, etag: impl Into<String>) -> TransferResult<()> {
        if part_number == 0 {
            return Err(TransferError::protocol("part numbers start at 1"));
        }
        let part = CompletedPart {
            part_number,
            etag: etag.into(),
        };
        match self
            .completed_parts
            .binary_search_by_key(&part_number, |p| p.part_number)
        {
            Ok(idx) => self.completed_parts[idx] = part,
            Err(idx) => self.completed_parts.insert(idx, part),
        }
        Ok(())
    }

    /// Check the completed list is contiguous `1..=expected`.
    pub fn verify_complete(&self, expected: u32) -> TransferResult<()> {
        if self.completed_parts.len() != expected as usize {
            return Err(TransferError::protocol(format!(
                "session {} has {} completed parts, expected {}",
                self.session_id,
                self.completed_parts.len(),
                expected
            )));
        }
        let contiguous = self
            .completed_parts
            .iter()
            .enumerate()
            .all(|(idx, p)| p.part_number as usize == idx + 1);
        if !contiguous {
            return Err(TransferError::protocol(format!(
                "session {} has gaps in its part list",
                self.session_id
            )));
        }
        Ok(())
    }
}

/// Wire form of a part window: `"from-to"`, both inclusive.
pub fn part_range(from: u32) -> String {
    format!("{}-{}", from, from + PART_URL_BATCH - 1)
}
