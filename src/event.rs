//! Probe lifecycle events.
//!
//! Events are the only thing probers hand to the rest of the system.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle stage of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sent,
    Success,
    Timeout,
    Failed,
}

impl EventKind {
    /// Whether this kind closes out a round for its target.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventKind::Sent)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Sent => "SENT",
            EventKind::Success => "SUCCESS",
            EventKind::Timeout => "TIMEOUT",
            EventKind::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Protocol-specific facts attached to a terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProbeDetail {
    Http { status: u16 },
    Dns { rcode: u8, answers: u16 },
    Ntp { offset_ms: f64, stratum: u8 },
}

/// One lifecycle transition for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Display name of the target; unique per logical destination.
    pub key: String,
    pub kind: EventKind,
    /// When the round's request was sent.
    pub sent_at: DateTime<Utc>,
    /// Zero unless `kind` is `Success`.
    pub rtt: Duration,
    /// Empty unless the attempt failed.
    pub message: String,
    pub detail: Option<ProbeDetail>,
}

impl Event {
    pub fn sent(key: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            kind: EventKind::Sent,
            sent_at,
            rtt: Duration::ZERO,
            message: String::new(),
            detail: None,
        }
    }

    pub fn success(key: impl Into<String>, sent_at: DateTime<Utc>, rtt: Duration) -> Self {
        Self {
            key: key.into(),
            kind: EventKind::Success,
            sent_at,
            rtt,
            message: String::new(),
            detail: None,
        }
    }

    pub fn timeout(
        key: impl Into<String>,
        sent_at: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            kind: EventKind::Timeout,
            sent_at,
            rtt: Duration::ZERO,
            message: message.into(),
            detail: None,
        }
    }

    pub fn failed(
        key: impl Into<String>,
        sent_at: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            kind: EventKind::Failed,
            sent_at,
            rtt: Duration::ZERO,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Option<ProbeDetail>) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let now = Utc::now();
        let ev = Event::success("a", now, Duration::from_millis(5));
        assert_eq!(ev.kind, EventKind::Success);
        assert!(ev.kind.is_terminal());
        assert!(ev.message.is_empty());

        let ev = Event::failed("a", now, "connection refused");
        assert_eq!(ev.rtt, Duration::ZERO);
        assert_eq!(ev.message, "connection refused");

        assert!(!Event::sent("a", now).kind.is_terminal());
        assert_eq!(EventKind::Timeout.to_string(), "TIMEOUT");
    }
}
