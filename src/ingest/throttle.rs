// src/ingest/throttle.rs
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::ingest::store::Store;
use crate::ingest::types::{FrequencyClass, Source};

/// Per-source minimum re-fetch spacing.
///
/// Throttle state is not stored on its own: it is derived from the
/// FeedSnapshot's last successful fetch plus the interval of the source's
/// frequency class. A source that was never fetched is never throttled.
#[derive(Debug, Clone)]
pub struct ThrottleGuard {
    base: Duration,
    high_multiplier: u32,
    low_multiplier: u32,
}

impl ThrottleGuard {
    pub fn new(base_interval_secs: u64, high_multiplier: u32, low_multiplier: u32) -> Self {
        let secs = i64::try_from(base_interval_secs).unwrap_or(i64::MAX);
        Self {
            base: Duration::seconds(secs),
            high_multiplier,
            low_multiplier,
        }
    }

    pub fn interval_for(&self, class: FrequencyClass) -> Duration {
        let mult = match class {
            FrequencyClass::High => self.high_multiplier,
            FrequencyClass::Low => self.low_multiplier,
        };
        self.base * i32::try_from(mult).unwrap_or(i32::MAX)
    }

    /// Pure check against an already-known last fetch time.
    pub fn is_throttled(
        &self,
        class: FrequencyClass,
        last_fetched: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match last_fetched {
            None => false,
            Some(last) => now.signed_duration_since(last) < self.interval_for(class),
        }
    }

    /// Looks up the source's FeedSnapshot and applies [`is_throttled`](Self::is_throttled).
    pub async fn should_throttle(&self, store: &Store, source: &Source) -> Result<bool> {
        self.should_throttle_at(store, source, Utc::now()).await
    }

    pub async fn should_throttle_at(
        &self,
        store: &Store,
        source: &Source,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let last = store.last_fetched_at(&source.url).await?;
        Ok(self.is_throttled(source.frequency, last, now))
    }
}
