// src/ingest/quota.rs
//! Process-wide download budget.
//!
//! A leaky-bucket counter that empties completely once the window (24h) has
//! elapsed since `window_start`. The rollover is applied lazily on every call,
//! there is no background timer. All mutation goes through one mutex so the
//! check-and-increment in [`QuotaTracker::try_consume`] is atomic across
//! concurrent fetches.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::fs;

pub const DEFAULT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub bytes_consumed: u64,
    pub window_start: DateTime<Utc>,
}

impl QuotaState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            bytes_consumed: 0,
            window_start: now,
        }
    }
}

#[derive(Debug)]
pub struct QuotaTracker {
    cap: u64,
    window: Duration,
    state: Mutex<QuotaState>,
}

impl QuotaTracker {
    pub fn new(cap: u64) -> Self {
        Self::with_state(cap, QuotaState::fresh(Utc::now()))
    }

    pub fn with_state(cap: u64, state: QuotaState) -> Self {
        Self {
            cap,
            window: Duration::hours(DEFAULT_WINDOW_HOURS),
            state: Mutex::new(state),
        }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// True when `n` more bytes fit in the current window.
    pub fn can_consume(&self, n: u64) -> bool {
        self.can_consume_at(n, Utc::now())
    }

    pub fn can_consume_at(&self, n: u64, now: DateTime<Utc>) -> bool {
        let st = self.lock_rolled(now);
        st.bytes_consumed.saturating_add(n) <= self.cap
    }

    /// Unconditionally register `n` bytes.
    pub fn consume(&self, n: u64) {
        self.consume_at(n, Utc::now())
    }

    pub fn consume_at(&self, n: u64, now: DateTime<Utc>) {
        let mut st = self.lock_rolled(now);
        st.bytes_consumed = st.bytes_consumed.saturating_add(n);
        gauge!("ingest_quota_used_bytes").set(st.bytes_consumed as f64);
    }

    /// Register `n` bytes only if they fit. Check and increment happen under
    /// the same lock.
    pub fn try_consume(&self, n: u64) -> bool {
        self.try_consume_at(n, Utc::now())
    }

    pub fn try_consume_at(&self, n: u64, now: DateTime<Utc>) -> bool {
        let mut st = self.lock_rolled(now);
        let next = st.bytes_consumed.saturating_add(n);
        if next > self.cap {
            return false;
        }
        st.bytes_consumed = next;
        gauge!("ingest_quota_used_bytes").set(next as f64);
        true
    }

    pub fn used(&self) -> u64 {
        self.used_at(Utc::now())
    }

    pub fn used_at(&self, now: DateTime<Utc>) -> u64 {
        self.lock_rolled(now).bytes_consumed
    }

    /// Share of the cap consumed in the current window, in `[0, 1]` for a
    /// non-zero cap.
    pub fn fraction_used(&self) -> f64 {
        self.fraction_used_at(Utc::now())
    }

    pub fn fraction_used_at(&self, now: DateTime<Utc>) -> f64 {
        if self.cap == 0 {
            return 1.0;
        }
        self.used_at(now) as f64 / self.cap as f64
    }

    pub fn snapshot(&self) -> QuotaState {
        *self.lock_rolled(Utc::now())
    }

    /// Write the current window to `path` as JSON.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let snap = self.snapshot();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let body = serde_json::to_vec_pretty(&snap)?;
        fs::write(path, body)
            .await
            .with_context(|| format!("writing quota state to {}", path.display()))?;
        Ok(())
    }

    /// Rebuild a tracker from a snapshot written by [`persist`](Self::persist).
    /// A missing or unreadable file starts a fresh window; anything but a
    /// missing file is logged.
    pub async fn restore(path: &Path, cap: u64) -> Self {
        let now = Utc::now();
        let state = match fs::read_to_string(path).await {
            Ok(s) => match serde_json::from_str::<QuotaState>(&s) {
                Ok(st) if st.window_start <= now => st,
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "quota window starts in the future, resetting");
                    QuotaState::fresh(now)
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable quota state, resetting");
                    QuotaState::fresh(now)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => QuotaState::fresh(now),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read quota state, resetting");
                QuotaState::fresh(now)
            }
        };
        Self::with_state(cap, state)
    }

    fn lock_rolled(&self, now: DateTime<Utc>) -> MutexGuard<'_, QuotaState> {
        // Plain counters: a poisoned lock still holds a usable value.
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now.signed_duration_since(st.window_start) >= self.window {
            tracing::info!(
                target: "ingest",
                consumed = st.bytes_consumed,
                "quota window elapsed, resetting"
            );
            *st = QuotaState::fresh(now);
        }
        st
    }
}
