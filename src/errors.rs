//! Error taxonomy shared by the transfer client, storage adapters and the
//! chunk loop.
//!
//! Every failure that crosses the storage adapter boundary is a
//! [`TransferError`]; its `Display` output is the human-readable message
//! surfaced to the caller.

use std::{io, time::Duration};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Timeout, DNS failure, connection reset, ...
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response or `success: false` envelope.
    #[error("backend returned {status}: {message}")]
    Http { status: u16, message: String },

    /// A presigned URL was refused (403) even after one refresh.
    #[error("presigned URL for part {part_number} expired")]
    UrlExpired { part_number: u32 },

    /// Local validation failure. Never sent over the wire.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Refused locally by the rate limiter, or a 429 from the backend.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Response missing expected fields, part-count mismatch, ETag mismatch.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// `verify-storage` reports less room than the plan needs.
    #[error("backend has {available} bytes free, transfer needs {needed}")]
    InsufficientStorage { needed: u64, available: u64 },

    #[error("transfer job {0} not found")]
    JobNotFound(Uuid),

    #[error("transfer job {0} is already finished")]
    Terminal(Uuid),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    /// Shortcut for a local validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shortcut for a protocol/contract violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether this failure should be charged to the job's failure budget.
    /// Rate limiting is the backend protecting itself, not the job's fault.
    pub fn counts_against_budget(&self) -> bool {
        !self.is_rate_limited()
    }

    /// Local validation failures can never succeed on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// HTTP-ish status for logging and for synthetic local refusals.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::UrlExpired { .. } => Some(403),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_free() {
        let limited = TransferError::RateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert!(!limited.counts_against_budget());
        assert!(!limited.is_fatal());
        assert_eq!(limited.status(), Some(429));
    }

    #[test]
    fn validation_is_fatal() {
        let err = TransferError::validation("missing token");
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "validation failed: missing token");
    }

    #[test]
    fn other_failures_count() {
        let http = TransferError::Http {
            status: 500,
            message: "boom".into(),
        };
        assert!(http.counts_against_budget());
        assert!(TransferError::UrlExpired { part_number: 5 }.counts_against_budget());
        assert!(TransferError::protocol("no session id").counts_against_budget());
    }

    #[test]
    fn display_carries_message() {
        let err = TransferError::Http {
            status: 507,
            message: "quota exceeded".into(),
        };
        assert_eq!(err.to_string(), "backend returned 507: quota exceeded");
    }
}
