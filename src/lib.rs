//! netprobe - multi-protocol network prober.
//!
//! Probes ICMP, HTTP(S), TCP, DNS and NTP targets on a fixed interval and
//! keeps live per-target statistics and bounded history.

pub mod codes;
pub mod config;
pub mod event;
pub mod manager;
pub mod metrics;
pub mod probe;
pub mod target;

pub use codes::{is_valid_code_pattern, match_code};
pub use config::{ProberConfig, ProberEntry, ProberSettings, RuntimeConfig};
pub use event::{Event, EventKind, ProbeDetail};
pub use manager::{event_channel, ProbeManager, Route, ShutdownHandle};
pub use metrics::{HistoryEntry, Metrics, MetricsManager, SortKey, SortOrder, TargetHistory};
pub use target::{parse_target, ProbeTarget};
