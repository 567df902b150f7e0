//! URL-level short-circuit for rate-limited backend endpoints.
//!
//! Keys are a namespaced, truncated MD5 of the URL, so collisions only
//! over-block. A second, global key is set on every 429 so unrelated
//! endpoints also back off briefly. No retries happen here; the transfer
//! client consults [`RateLimiter::check`] before every request.

use crate::services::clock::Clock;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, warn};

const KEY_PREFIX: &str = "transfer_rl_";
const GLOBAL_KEY: &str = "transfer_rl_global";

/// Upper bound on how long one endpoint's 429 stalls every other endpoint.
pub const GLOBAL_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Shared by every job in the process.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stable key for a URL. `https://a/b` and `https://a/b/` share a key.
    pub fn key_for(url: &str) -> String {
        let digest = md5::compute(url.trim_end_matches('/'));
        let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        format!("{KEY_PREFIX}{n}")
    }

    pub fn is_blocked(&self, url: &str) -> bool {
        self.check(url).is_some()
    }

    /// Remaining block time for `url`, counting the global flag.
    pub fn check(&self, url: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.retain(|_, expiry| *expiry > now);

        [Self::key_for(url).as_str(), GLOBAL_KEY]
            .iter()
            .filter_map(|key| entries.get(*key))
            .max()
            .and_then(|expiry| (*expiry - now).to_std().ok())
    }

    /// Block `url` for `retry_after`, and every URL for up to
    /// [`GLOBAL_BACKOFF_CAP`].
    pub fn record_block(&self, url: &str, retry_after: Duration) {
        let now = self.clock.now();
        let until = expiry_after(now, retry_after);
        let global = expiry_after(now, retry_after.min(GLOBAL_BACKOFF_CAP));

        warn!(
            url,
            retry_after_secs = retry_after.as_secs(),
            "endpoint rate limited"
        );

        let mut entries = self.lock();
        let key = Self::key_for(url);
        let slot = entries.entry(key).or_insert(until);
        if *slot < until {
            *slot = until;
        }
        let slot = entries.entry(GLOBAL_KEY.to_string()).or_insert(global);
        if *slot < global {
            *slot = global;
        }
        debug!(tracked = entries.len(), "rate limit entries");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    fn limiter() -> (ManualClock, RateLimiter) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::new(Arc::new(clock.clone()));
        (clock, limiter)
    }

    #[test]
    fn key_ignores_trailing_slash() {
        assert_eq!(
            RateLimiter::key_for("https://api.invalid/verify-storage"),
            RateLimiter::key_for("https://api.invalid/verify-storage/")
        );
        assert_ne!(
            RateLimiter::key_for("https://api.invalid/verify-storage"),
            RateLimiter::key_for("https://api.invalid/backups")
        );
        assert!(RateLimiter::key_for("x").starts_with("transfer_rl_"));
    }

    #[test]
    fn block_expires_after_retry_after() {
        let (clock, limiter) = limiter();
        let url = "https://api.invalid/verify-storage";
        assert!(!limiter.is_blocked(url));

        limiter.record_block(url, Duration::from_secs(60));
        assert!(limiter.is_blocked(url));

        clock.advance(chrono::Duration::seconds(59));
        assert!(limiter.is_blocked(url));

        clock.advance(chrono::Duration::seconds(2));
        assert!(!limiter.is_blocked(url));
    }

    #[test]
    fn global_flag_is_short() {
        let (clock, limiter) = limiter();
        limiter.record_block("https://api.invalid/a", Duration::from_secs(60));

        let other = "https://api.invalid/b";
        let remaining = limiter.check(other).unwrap();
        assert!(remaining <= GLOBAL_BACKOFF_CAP);

        clock.advance(chrono::Duration::seconds(11));
        assert!(!limiter.is_blocked(other));
        assert!(limiter.is_blocked("https://api.invalid/a"));
    }

    #[test]
    fn shorter_block_does_not_shrink_longer_one() {
        let (clock, limiter) = limiter();
        let url = "https://api.invalid/a";
        limiter.record_block(url, Duration::from_secs(60));
        limiter.record_block(url, Duration::from_secs(5));
        clock.advance(chrono::Duration::seconds(30));
        assert!(limiter.is_blocked(url));
    }
}
