//! The ordered list of (local, remote) pairs a job walks through.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which way bytes flow for every entry of a plan.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local file -> remote object.
    Upload,
    /// Remote object -> local file.
    Download,
}

/// What finishing an entry means for job completion.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    /// The backup archive itself.
    Archive,
    /// Small companion file that must also land (e.g. an installer).
    SideChannel,
    #[default]
    Plain,
}

/// One (local, remote) pair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransferEntry {
    /// Path on the local filesystem.
    pub local: PathBuf,

    /// Object name at the backend.
    pub remote: String,

    /// Directories cost nothing: they are created and skipped.
    #[serde(default)]
    pub is_dir: bool,

    #[serde(default)]
    pub role: EntryRole,
}

impl TransferEntry {
    pub fn file(local: impl Into<PathBuf>, remote: impl Into<String>, role: EntryRole) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            is_dir: false,
            role,
        }
    }

    pub fn dir(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            is_dir: true,
            role: EntryRole::Plain,
        }
    }
}

/// Direction plus entries, stored with the job so any later invocation can
/// pick the plan back up.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransferPlan {
    pub direction: Direction,
    pub entries: Vec<TransferEntry>,
}

impl TransferPlan {
    pub fn upload(entries: Vec<TransferEntry>) -> Self {
        Self {
            direction: Direction::Upload,
            entries,
        }
    }

    pub fn download(entries: Vec<TransferEntry>) -> Self {
        Self {
            direction: Direction::Download,
            entries,
        }
    }

    pub fn has_archive(&self) -> bool {
        self.entries.iter().any(|e| e.role == EntryRole::Archive)
    }

    /// Whether the plan carries a side-channel entry that must finish
    /// before the job can succeed.
    pub fn has_side_channel(&self) -> bool {
        self.entries.iter().any(|e| e.role == EntryRole::SideChannel)
    }
}
