use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sliding-window admission counter.
///
/// Timestamps are milliseconds on a monotonic clock supplied by the caller.
/// Entries whose age reaches the window length are purged lazily whenever the
/// window is checked or written, so every retained entry is strictly younger
/// than `window`.
#[derive(Debug, Clone)]
pub struct RateWindow {
    max_calls: usize,
    window_ms: u64,
    admitted: VecDeque<u64>,
}

/// Read-only view of the limiter handed to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStatus {
    pub remaining: usize,
    pub wait_seconds: u64,
}

impl RateWindow {
    /// `max_calls` is clamped to at least one; a zero-capacity window could
    /// never report a finite wait.
    pub fn new(max_calls: usize, window: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1),
            admitted: VecDeque::with_capacity(max_calls),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Purges expired entries and reports whether one more call fits.
    /// Does not record anything.
    pub fn can_admit(&mut self, now_ms: u64) -> bool {
        self.purge(now_ms);
        self.admitted.len() < self.max_calls
    }

    pub fn record_admission(&mut self, now_ms: u64) {
        self.purge(now_ms);
        self.admitted.push_back(now_ms);
    }

    /// Zero when a call would be admitted now, otherwise the time until the
    /// oldest retained entry leaves the window.
    pub fn time_until_next_slot(&self, now_ms: u64) -> Duration {
        let mut live = self.live(now_ms);
        let count = live.clone().count();
        if count < self.max_calls {
            return Duration::ZERO;
        }
        let Some(oldest) = live.next() else {
            return Duration::ZERO;
        };
        let expires_at = oldest.saturating_add(self.window_ms);
        Duration::from_millis(expires_at.saturating_sub(now_ms))
    }

    pub fn remaining(&self, now_ms: u64) -> usize {
        self.max_calls.saturating_sub(self.live(now_ms).count())
    }

    pub fn status(&self, now_ms: u64) -> RateStatus {
        let wait = self.time_until_next_slot(now_ms);
        RateStatus {
            remaining: self.remaining(now_ms),
            wait_seconds: wait.as_millis().div_ceil(1000) as u64,
        }
    }

    fn is_live(&self, timestamp: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(timestamp) < self.window_ms
    }

    fn live(&self, now_ms: u64) -> impl Iterator<Item = u64> + Clone + '_ {
        self.admitted
            .iter()
            .copied()
            .filter(move |timestamp| self.is_live(*timestamp, now_ms))
    }

    fn purge(&mut self, now_ms: u64) {
        while let Some(oldest) = self.admitted.front().copied() {
            if self.is_live(oldest, now_ms) {
                break;
            }
            self.admitted.pop_front();
        }
    }
}
