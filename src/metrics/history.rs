//! Fixed-capacity per-target history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::ProbeDetail;

/// Outcome of one completed probe round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "super::serialize_ms")]
    pub rtt: Duration,
    pub success: bool,
    /// Empty on success
    pub error: String,
    pub detail: Option<ProbeDetail>,
}

/// Ring buffer of the latest [`HistoryEntry`] values, newest overwriting
/// oldest once full.
#[derive(Debug, Clone)]
pub struct TargetHistory {
    entries: Vec<HistoryEntry>,
    capacity: usize,
    /// Slot the next entry is written to
    cursor: usize,
}

impl TargetHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
        } else {
            self.entries[self.cursor] = entry;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    /// Entries newest first.
    pub fn iter_recent(&self) -> impl Iterator<Item = &HistoryEntry> {
        let len = self.entries.len();
        let cursor = self.cursor;
        (1..=len).map(move |back| &self.entries[(cursor + len - back) % len])
    }

    /// Up to `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        self.iter_recent().take(n).cloned().collect()
    }

    /// Entries at or after `since`, newest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<HistoryEntry> {
        self.iter_recent()
            .take_while(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Failures in a row, counted back from the newest entry.
    pub fn consecutive_failures(&self) -> usize {
        self.iter_recent().take_while(|e| !e.success).count()
    }

    pub fn consecutive_successes(&self) -> usize {
        self.iter_recent().take_while(|e| e.success).count()
    }

    /// Percentage of successful entries in the trailing `window`.
    pub fn success_rate(&self, window: Duration) -> f64 {
        self.success_rate_at(Utc::now(), window)
    }

    /// Like [`TargetHistory::success_rate`], as of `now`. 0 for an empty
    /// window.
    pub fn success_rate_at(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        let start = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let (total, ok) = self
            .iter_recent()
            .take_while(|e| e.timestamp >= start)
            .fold((0usize, 0usize), |(total, ok), e| (total + 1, ok + usize::from(e.success)));

        if total == 0 {
            0.0
        } else {
            ok as f64 / total as f64 * 100.0
        }
    }
}
