//! Per-target statistics and history fed from the event stream.

mod history;

pub use history::*;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{Event, EventKind, ProbeDetail};

/// Live statistics for one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub key: String,
    pub total_sent: u64,
    pub successful: u64,
    pub failed: u64,
    pub loss_percent: f64,
    #[serde(rename = "last_rtt_ms", serialize_with = "serialize_ms")]
    pub last_rtt: Duration,
    #[serde(rename = "min_rtt_ms", serialize_with = "serialize_ms")]
    pub min_rtt: Duration,
    #[serde(rename = "max_rtt_ms", serialize_with = "serialize_ms")]
    pub max_rtt: Duration,
    #[serde(rename = "avg_rtt_ms", serialize_with = "serialize_ms")]
    pub avg_rtt: Duration,
    #[serde(skip)]
    total_rtt: Duration,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_detail: Option<ProbeDetail>,
}

impl Metrics {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    fn record_success(&mut self, rtt: Duration, at: DateTime<Utc>) {
        self.successful += 1;
        self.last_rtt = rtt;
        if self.successful == 1 || rtt < self.min_rtt {
            self.min_rtt = rtt;
        }
        if rtt > self.max_rtt {
            self.max_rtt = rtt;
        }
        self.total_rtt += rtt;
        self.avg_rtt = self.total_rtt / u32::try_from(self.successful).unwrap_or(u32::MAX);
        self.last_success = Some(at);
        self.update_loss();
    }

    fn record_failure(&mut self, message: &str, at: DateTime<Utc>) {
        self.failed += 1;
        self.last_failure = Some(at);
        self.last_error = Some(message.to_string());
        self.update_loss();
    }

    fn update_loss(&mut self) {
        let completed = self.successful + self.failed;
        self.loss_percent = if completed == 0 {
            0.0
        } else {
            self.failed as f64 / completed as f64 * 100.0
        };
    }
}

pub(crate) fn serialize_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_nanos() as f64 / 1_000_000.0)
}

/// Field a snapshot can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Host,
    Sent,
    Success,
    Fail,
    Loss,
    Last,
    Avg,
    Best,
    Worst,
    LastSuccessTime,
    LastFailTime,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown sort key {0:?}")]
pub struct UnknownSortKey(pub String);

impl FromStr for SortKey {
    type Err = UnknownSortKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s.trim().to_ascii_lowercase().as_str() {
            "host" => SortKey::Host,
            "sent" => SortKey::Sent,
            "success" => SortKey::Success,
            "fail" => SortKey::Fail,
            "loss" => SortKey::Loss,
            "last" => SortKey::Last,
            "avg" => SortKey::Avg,
            "best" => SortKey::Best,
            "worst" => SortKey::Worst,
            "last-success-time" => SortKey::LastSuccessTime,
            "last-fail-time" => SortKey::LastFailTime,
            _ => return Err(UnknownSortKey(s.to_string())),
        };
        Ok(key)
    }
}

impl SortKey {
    fn compare(self, a: &Metrics, b: &Metrics) -> Ordering {
        match self {
            SortKey::Host => a.key.cmp(&b.key),
            SortKey::Sent => a.total_sent.cmp(&b.total_sent),
            SortKey::Success => a.successful.cmp(&b.successful),
            SortKey::Fail => a.failed.cmp(&b.failed),
            SortKey::Loss => a.loss_percent.total_cmp(&b.loss_percent),
            SortKey::Last => a.last_rtt.cmp(&b.last_rtt),
            SortKey::Avg => a.avg_rtt.cmp(&b.avg_rtt),
            SortKey::Best => a.min_rtt.cmp(&b.min_rtt),
            SortKey::Worst => a.max_rtt.cmp(&b.max_rtt),
            SortKey::LastSuccessTime => a.last_success.cmp(&b.last_success),
            SortKey::LastFailTime => a.last_failure.cmp(&b.last_failure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug)]
struct TargetState {
    metrics: Metrics,
    history: TargetHistory,
}

/// Shared statistics store. Clones share the same state.
#[derive(Debug, Clone)]
pub struct MetricsManager {
    targets: Arc<Mutex<HashMap<String, TargetState>>>,
    history_size: usize,
}

impl MetricsManager {
    pub fn new(history_size: usize) -> Self {
        Self {
            targets: Arc::new(Mutex::new(HashMap::new())),
            history_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TargetState>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume `events` in the background until every sender is gone.
    pub fn subscribe(&self, mut events: mpsc::Receiver<Event>) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                metrics.record(&event);
            }
            tracing::debug!("metrics: event stream closed");
        })
    }

    /// Apply one event.
    pub fn record(&self, event: &Event) {
        let mut targets = self.lock();
        let state = targets
            .entry(event.key.clone())
            .or_insert_with(|| TargetState {
                metrics: Metrics::new(&event.key),
                history: TargetHistory::new(self.history_size),
            });

        match event.kind {
            EventKind::Sent => state.metrics.total_sent += 1,
            EventKind::Success => {
                state.metrics.record_success(event.rtt, event.sent_at);
                if event.detail.is_some() {
                    state.metrics.last_detail = event.detail.clone();
                }
                state.history.push(HistoryEntry {
                    timestamp: event.sent_at,
                    rtt: event.rtt,
                    success: true,
                    error: String::new(),
                    detail: event.detail.clone(),
                });
            }
            EventKind::Timeout | EventKind::Failed => {
                state.metrics.record_failure(&event.message, event.sent_at);
                if event.detail.is_some() {
                    state.metrics.last_detail = event.detail.clone();
                }
                state.history.push(HistoryEntry {
                    timestamp: event.sent_at,
                    rtt: Duration::ZERO,
                    success: false,
                    error: event.message.clone(),
                    detail: event.detail.clone(),
                });
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Metrics> {
        self.lock().get(key).map(|s| s.metrics.clone())
    }

    /// Every target's metrics, ordered by key.
    pub fn snapshot(&self) -> Vec<Metrics> {
        let mut all: Vec<Metrics> = self.lock().values().map(|s| s.metrics.clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Snapshot ordered by `key`; ties keep key order.
    pub fn sorted(&self, key: SortKey, order: SortOrder) -> Vec<Metrics> {
        let mut all = self.snapshot();
        match order {
            SortOrder::Ascending => all.sort_by(|a, b| key.compare(a, b)),
            SortOrder::Descending => all.sort_by(|a, b| key.compare(b, a)),
        }
        all
    }

    /// Zero every target's statistics and history; targets stay known.
    pub fn reset_all(&self) {
        let mut targets = self.lock();
        for (key, state) in targets.iter_mut() {
            state.metrics = Metrics::new(key);
            state.history.clear();
        }
        tracing::info!("metrics: reset {} targets", targets.len());
    }

    pub fn recent(&self, key: &str, n: usize) -> Vec<HistoryEntry> {
        self.lock()
            .get(key)
            .map(|s| s.history.recent(n))
            .unwrap_or_default()
    }

    pub fn since(&self, key: &str, since: DateTime<Utc>) -> Vec<HistoryEntry> {
        self.lock()
            .get(key)
            .map(|s| s.history.since(since))
            .unwrap_or_default()
    }

    pub fn consecutive_failures(&self, key: &str) -> usize {
        self.lock()
            .get(key)
            .map_or(0, |s| s.history.consecutive_failures())
    }

    pub fn consecutive_successes(&self, key: &str) -> usize {
        self.lock()
            .get(key)
            .map_or(0, |s| s.history.consecutive_successes())
    }

    pub fn success_rate(&self, key: &str, window: Duration) -> f64 {
        self.lock()
            .get(key)
            .map_or(0.0, |s| s.history.success_rate(window))
    }
}
