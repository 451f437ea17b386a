//! Storage timestamps and expiry
//!
//! Expiration-aware strategies stamp the copy they store with a synthetic
//! `sw-cached-date` header (epoch milliseconds). Entries without the header
//! predate expiration tracking and are always fresh. A header that does not
//! parse never counts as fresh.

use hyper::header::{HeaderName, HeaderValue};
use std::time::Duration;
use tracing::{debug, info};

use super::generation::Generation;
use crate::clock::Clock;
use crate::fetch::FetchResponse;

/// Header recording when an entry was stored
pub const STORED_AT_HEADER: &str = "sw-cached-date";

/// Storage timestamp carried by a cached response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// Written before expiration tracking existed
    Missing,
    /// Stored at this epoch millisecond
    At(i64),
    /// Header present but unreadable
    Invalid,
}

impl Stamp {
    pub fn of(response: &FetchResponse) -> Self {
        match response.headers.get(STORED_AT_HEADER) {
            None => Stamp::Missing,
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(Stamp::At)
                .unwrap_or(Stamp::Invalid),
        }
    }

    /// Whether the entry may still be served under `max_age`.
    ///
    /// Unstamped entries always qualify; a stamped entry qualifies while its
    /// age is strictly below `max_age`.
    pub fn is_within(&self, now_ms: i64, max_age: Duration) -> bool {
        match self {
            Stamp::Missing => true,
            Stamp::At(stored_at) => now_ms.saturating_sub(*stored_at) < millis(max_age),
            Stamp::Invalid => false,
        }
    }

    /// Whether a sweep should delete the entry: stamped and older than `max_age`
    pub fn is_expired(&self, now_ms: i64, max_age: Duration) -> bool {
        match self {
            Stamp::At(stored_at) => now_ms.saturating_sub(*stored_at) > millis(max_age),
            Stamp::Missing | Stamp::Invalid => false,
        }
    }
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Copy of `response` stamped with `now_ms`
pub fn stamped(response: &FetchResponse, now_ms: i64) -> FetchResponse {
    let mut copy = response.clone();
    copy.headers.insert(
        HeaderName::from_static(STORED_AT_HEADER),
        HeaderValue::from(now_ms),
    );
    copy
}

/// Delete every stamped entry of `generation` older than `max_age`.
///
/// Returns the number of entries removed.
pub async fn sweep_expired(generation: &Generation, max_age: Duration, clock: &dyn Clock) -> usize {
    let mut removed = 0;
    for key in generation.keys().await {
        let Some(response) = generation.lookup(&key).await else {
            continue;
        };
        if Stamp::of(&response).is_expired(clock.now_ms(), max_age) && generation.evict(&key).await {
            debug!(cache = generation.name(), key = %key, "Cleaned expired cache entry");
            removed += 1;
        }
    }

    if removed > 0 {
        info!(cache = generation.name(), removed = removed, "Expired entries swept");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::{CacheStorage, MemoryCacheStorage};
    use crate::clock::ManualClock;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_stamp_parsing() {
        let plain = FetchResponse::ok("text/html", "x");
        assert_eq!(Stamp::of(&plain), Stamp::Missing);
        assert_eq!(Stamp::of(&stamped(&plain, 42)), Stamp::At(42));

        let garbage = plain.with_header(HeaderName::from_static(STORED_AT_HEADER), "yesterday");
        assert_eq!(Stamp::of(&garbage), Stamp::Invalid);
    }

    #[test]
    fn test_freshness_boundaries() {
        let max = millis(HOUR);
        let stamp = Stamp::At(1_000);

        assert!(stamp.is_within(1_000 + max - 1, HOUR));
        assert!(!stamp.is_within(1_000 + max, HOUR));
        assert!(!stamp.is_expired(1_000 + max, HOUR));
        assert!(stamp.is_expired(1_000 + max + 1, HOUR));

        assert!(Stamp::Missing.is_within(i64::MAX, HOUR));
        assert!(!Stamp::Missing.is_expired(i64::MAX, HOUR));
        assert!(!Stamp::Invalid.is_within(0, HOUR));
        assert!(!Stamp::Invalid.is_expired(i64::MAX, HOUR));
    }

    #[test]
    fn test_extreme_stamps_do_not_overflow() {
        let ancient = Stamp::At(i64::MIN);
        assert!(!ancient.is_within(1_700_000_000_000, HOUR));
        assert!(ancient.is_expired(1_700_000_000_000, HOUR));

        let future = Stamp::At(i64::MAX);
        assert!(future.is_within(i64::MIN, HOUR));
        assert!(!future.is_expired(i64::MIN, HOUR));
    }

    #[tokio::test]
    async fn test_sweep_only_removes_old_stamped_entries() {
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryCacheStorage::new());
        let generation = Generation::new("maestro-quiz-dynamic-v2".into(), storage);
        let clock = ManualClock::new(10 * millis(HOUR));
        let body = FetchResponse::ok("text/html", "page");

        generation.store("https://quiz.example/old", stamped(&body, 0)).await;
        generation
            .store("https://quiz.example/fresh", stamped(&body, 10 * millis(HOUR) - 60_000))
            .await;
        generation.store("https://quiz.example/legacy", body.clone()).await;

        let removed = sweep_expired(&generation, HOUR, &clock).await;

        assert_eq!(removed, 1);
        assert_eq!(
            generation.keys().await,
            vec!["https://quiz.example/fresh", "https://quiz.example/legacy"]
        );
    }
}
