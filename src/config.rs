//! Configuration for netprobe.
//!
//! Runtime settings come from environment variables with sensible defaults.
//! Prober bindings (scheme name → protocol + options) default to the built-in
//! protocols and can be extended from a JSON file.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codes::is_valid_code_pattern;
use crate::probe::RecordType;
use crate::target::is_valid_scheme;

/// Default ring size for per-target history.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid prober {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Time between probe rounds (default: 1s)
    pub interval: Duration,
    /// Per-attempt timeout (default: 1s)
    pub timeout: Duration,
    /// History entries kept per target (default: 100)
    pub history_size: usize,
    /// How often the runner logs a summary (default: 10s)
    pub report_interval: Duration,
    /// Optional JSON file with prober bindings
    pub probers_path: Option<PathBuf>,
    /// Targets to probe, in addition to command-line arguments
    pub targets: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(1000),
            history_size: DEFAULT_HISTORY_SIZE,
            report_interval: Duration::from_secs(10),
            probers_path: None,
            targets: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETPROBE_INTERVAL_MS`: round interval in milliseconds (default: 1000)
    /// - `NETPROBE_TIMEOUT_MS`: attempt timeout in milliseconds (default: 1000)
    /// - `NETPROBE_HISTORY_SIZE`: history entries per target (default: 100)
    /// - `NETPROBE_REPORT_SECS`: summary log interval in seconds (default: 10)
    /// - `NETPROBE_PROBERS`: path to a JSON prober settings file
    /// - `NETPROBE_TARGETS`: comma-separated targets
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = lookup("NETPROBE_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            if ms > 0 {
                cfg.interval = Duration::from_millis(ms);
            }
        }

        if let Some(ms) = lookup("NETPROBE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            if ms > 0 {
                cfg.timeout = Duration::from_millis(ms);
            }
        }

        if let Some(size) = lookup("NETPROBE_HISTORY_SIZE").and_then(|v| v.parse().ok()) {
            if size > 0 {
                cfg.history_size = size;
            }
        }

        if let Some(secs) = lookup("NETPROBE_REPORT_SECS").and_then(|v| v.parse().ok()) {
            if secs > 0 {
                cfg.report_interval = Duration::from_secs(secs);
            }
        }

        if let Some(path) = lookup("NETPROBE_PROBERS").filter(|p| !p.is_empty()) {
            cfg.probers_path = Some(PathBuf::from(path));
        }

        if let Some(targets) = lookup("NETPROBE_TARGETS") {
            cfg.targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        cfg
    }
}

/// ICMP echo options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpConfig {
    /// Extra payload appended to each echo request
    pub body: String,
    pub ttl: Option<u8>,
    /// Type-of-service byte (IPv4 only)
    pub tos: Option<u8>,
    /// Local address or device name to send from
    pub source_interface: Option<String>,
}

/// HTTP(S) request and success criteria.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub headers: BTreeMap<String, String>,
    /// Exact status code; ignored when `expect_codes` is set
    pub expect_code: Option<u16>,
    /// Status code pattern, e.g. `"2XX,301-302"`
    pub expect_codes: Option<String>,
    /// Expected response body, compared after trimming
    pub expect_body: Option<String>,
    pub skip_tls_verify: bool,
    pub disable_redirects: bool,
    /// Use https for targets written with a custom scheme name
    pub secure: bool,
}

/// TCP connect options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub source_interface: Option<String>,
    pub dial_timeout_ms: Option<u64>,
}

impl TcpConfig {
    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout_ms.map(Duration::from_millis)
    }
}

/// DNS query options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Resolver to query
    pub server: String,
    pub port: u16,
    pub record_type: String,
    pub use_tcp: bool,
    /// Acceptable response codes; defaults to NOERROR only
    pub expect_rcodes: Option<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            server: "8.8.8.8".to_string(),
            port: 53,
            record_type: "A".to_string(),
            use_tcp: false,
            expect_rcodes: None,
        }
    }
}

/// NTP query options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    /// Server to query instead of the target host
    pub server: Option<String>,
    /// Port used when the target doesn't name one
    pub port: Option<u16>,
    pub version: u8,
    /// Largest acceptable clock offset; unbounded when unset
    pub max_offset_ms: Option<u64>,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: None,
            version: 4,
            max_offset_ms: None,
        }
    }
}

impl NtpConfig {
    pub fn max_offset(&self) -> Option<Duration> {
        self.max_offset_ms.map(Duration::from_millis)
    }
}

/// A protocol binding with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProberConfig {
    Icmpv4(IcmpConfig),
    Icmpv6(IcmpConfig),
    Http(HttpConfig),
    Tcp(TcpConfig),
    Dns(DnsConfig),
    Ntp(NtpConfig),
}

impl ProberConfig {
    pub fn protocol(&self) -> &'static str {
        match self {
            ProberConfig::Icmpv4(_) => "icmpv4",
            ProberConfig::Icmpv6(_) => "icmpv6",
            ProberConfig::Http(_) => "http",
            ProberConfig::Tcp(_) => "tcp",
            ProberConfig::Dns(_) => "dns",
            ProberConfig::Ntp(_) => "ntp",
        }
    }
}

/// A scheme name bound to a prober configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProberEntry {
    pub name: String,
    #[serde(flatten)]
    pub config: ProberConfig,
}

impl ProberEntry {
    pub fn new(name: impl Into<String>, config: ProberConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Ordered prober bindings. Routing tries them in this order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProberSettings {
    #[serde(default)]
    pub probers: Vec<ProberEntry>,
}

impl Default for ProberSettings {
    fn default() -> Self {
        Self {
            probers: vec![
                ProberEntry::new("icmpv4", ProberConfig::Icmpv4(IcmpConfig::default())),
                ProberEntry::new("icmpv6", ProberConfig::Icmpv6(IcmpConfig::default())),
                ProberEntry::new("http", ProberConfig::Http(HttpConfig::default())),
                ProberEntry::new("tcp", ProberConfig::Tcp(TcpConfig::default())),
                ProberEntry::new("dns", ProberConfig::Dns(DnsConfig::default())),
                ProberEntry::new("ntp", ProberConfig::Ntp(NtpConfig::default())),
            ],
        }
    }
}

impl ProberSettings {
    /// Settings with only the given bindings.
    pub fn with_entries(probers: Vec<ProberEntry>) -> Self {
        Self { probers }
    }

    /// Load bindings from a JSON file and lay them over the defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let file: ProberSettings = serde_json::from_str(&data)?;
        let mut settings = Self::default();
        settings.merge(file);
        settings.validate()?;
        Ok(settings)
    }

    /// Replace entries with matching names, append the rest.
    pub fn merge(&mut self, other: ProberSettings) {
        for entry in other.probers {
            match self.probers.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => existing.config = entry.config,
                None => self.probers.push(entry),
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProberConfig> {
        self.probers
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.config)
    }

    /// Static checks on every binding.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for entry in &self.probers {
            let name = entry.name.as_str();
            if name.is_empty() {
                return Err(ConfigError::invalid(name, "name is empty"));
            }
            if !is_valid_scheme(name) || name != name.to_ascii_lowercase() {
                return Err(ConfigError::invalid(name, "name must be a lowercase URL scheme"));
            }
            if !seen.insert(name) {
                return Err(ConfigError::invalid(name, "duplicate name"));
            }

            match &entry.config {
                ProberConfig::Icmpv4(_) | ProberConfig::Icmpv6(_) | ProberConfig::Tcp(_) => {}
                ProberConfig::Http(http) => {
                    if let Some(pattern) = &http.expect_codes {
                        if !is_valid_code_pattern(pattern) {
                            return Err(ConfigError::invalid(
                                name,
                                format!("invalid status code pattern {:?}", pattern),
                            ));
                        }
                    }
                    if let Some(code) = http.expect_code {
                        if !(100..=599).contains(&code) {
                            return Err(ConfigError::invalid(
                                name,
                                format!("status code {} out of range", code),
                            ));
                        }
                    }
                }
                ProberConfig::Dns(dns) => {
                    if dns.record_type.parse::<RecordType>().is_err() {
                        return Err(ConfigError::invalid(
                            name,
                            format!("unknown record type {:?}", dns.record_type),
                        ));
                    }
                    if let Some(pattern) = &dns.expect_rcodes {
                        if !is_valid_code_pattern(pattern) {
                            return Err(ConfigError::invalid(
                                name,
                                format!("invalid rcode pattern {:?}", pattern),
                            ));
                        }
                    }
                    if dns.port == 0 {
                        return Err(ConfigError::invalid(name, "port cannot be 0"));
                    }
                }
                ProberConfig::Ntp(ntp) => {
                    if !matches!(ntp.version, 3 | 4) {
                        return Err(ConfigError::invalid(
                            name,
                            format!("unsupported NTP version {}", ntp.version),
                        ));
                    }
                    if ntp.port == Some(0) {
                        return Err(ConfigError::invalid(name, "port cannot be 0"));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.timeout, Duration::from_secs(1));
        assert_eq!(cfg.history_size, DEFAULT_HISTORY_SIZE);
        assert!(cfg.probers_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: BTreeMap<&str, &str> = [
            ("NETPROBE_INTERVAL_MS", "250"),
            ("NETPROBE_TIMEOUT_MS", "oops"),
            ("NETPROBE_HISTORY_SIZE", "0"),
            ("NETPROBE_TARGETS", "8.8.8.8, https://example.com ,,"),
        ]
        .into_iter()
        .collect();
        let cfg = RuntimeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.interval, Duration::from_millis(250));
        assert_eq!(cfg.timeout, Duration::from_secs(1));
        assert_eq!(cfg.history_size, DEFAULT_HISTORY_SIZE);
        assert_eq!(cfg.targets, vec!["8.8.8.8", "https://example.com"]);
    }

    #[test]
    fn test_default_settings_are_valid() {
        let settings = ProberSettings::default();
        settings.validate().unwrap();
        assert!(matches!(settings.get("http"), Some(ProberConfig::Http(_))));
        assert!(settings.get("https").is_none());
    }

    #[test]
    fn test_json_file_merges_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"probers": [
                {{"name": "http", "protocol": "http", "expect_codes": "2XX", "skip_tls_verify": true}},
                {{"name": "api", "protocol": "http", "secure": true, "headers": {{"X-Probe": "1"}}}},
                {{"name": "office-ntp", "protocol": "ntp", "server": "10.1.1.1", "max_offset_ms": 50}}
            ]}}"#
        )
        .unwrap();

        let settings = ProberSettings::from_json_file(file.path()).unwrap();
        assert_eq!(settings.probers.len(), 8);
        assert_eq!(settings.probers[2].name, "http");

        match settings.get("http") {
            Some(ProberConfig::Http(http)) => {
                assert_eq!(http.expect_codes.as_deref(), Some("2XX"));
                assert!(http.skip_tls_verify);
            }
            other => panic!("unexpected {:?}", other),
        }
        match settings.get("office-ntp") {
            Some(ProberConfig::Ntp(ntp)) => {
                assert_eq!(ntp.version, 4);
                assert_eq!(ntp.max_offset(), Some(Duration::from_millis(50)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validation_rejects_bad_entries() {
        let bad_pattern = ProberSettings::with_entries(vec![ProberEntry::new(
            "http",
            ProberConfig::Http(HttpConfig {
                expect_codes: Some("2XX,abc".to_string()),
                ..Default::default()
            }),
        )]);
        assert!(bad_pattern.validate().is_err());

        let duplicate = ProberSettings::with_entries(vec![
            ProberEntry::new("tcp", ProberConfig::Tcp(TcpConfig::default())),
            ProberEntry::new("tcp", ProberConfig::Tcp(TcpConfig::default())),
        ]);
        assert!(duplicate.validate().is_err());

        let bad_name = ProberSettings::with_entries(vec![ProberEntry::new(
            "My Probe",
            ProberConfig::Tcp(TcpConfig::default()),
        )]);
        assert!(bad_name.validate().is_err());

        let bad_record = ProberSettings::with_entries(vec![ProberEntry::new(
            "dns",
            ProberConfig::Dns(DnsConfig {
                record_type: "BOGUS".to_string(),
                ..Default::default()
            }),
        )]);
        assert!(bad_record.validate().is_err());

        let bad_version = ProberSettings::with_entries(vec![ProberEntry::new(
            "ntp",
            ProberConfig::Ntp(NtpConfig {
                version: 2,
                ..Default::default()
            }),
        )]);
        assert!(bad_version.validate().is_err());
    }
}
