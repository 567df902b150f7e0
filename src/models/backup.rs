//! Records returned by the remote backup backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A finished backup object stored at the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BackupInfo {
    /// Archive name, unique within the account's flat namespace.
    pub name: String,

    /// Size in bytes.
    pub size: u64,

    /// Free-form description supplied when the upload was started.
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Result of `verify-storage`: the token is valid and this much room is left.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StorageQuota {
    pub used: u64,
    pub total: u64,
    #[serde(default)]
    pub max_backups: Option<u32>,
}

impl StorageQuota {
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// Presigned download location for one backup, fetched once per file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTarget {
    pub url: String,
    pub size: u64,
}
