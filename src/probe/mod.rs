//! Probe module for network monitoring.
//!
//! Supports ICMP echo, HTTP(S), TCP connect, DNS and NTP probes. Each
//! protocol lives behind one variant of [`Prober`].

mod dns;
mod http;
mod icmp;
mod ntp;
mod rounds;
mod tcp;

pub use dns::*;
pub use http::*;
pub use icmp::*;
pub use ntp::*;
pub use rounds::*;
pub use tcp::*;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use socket2::Socket;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::ProberConfig;
use crate::event::{Event, ProbeDetail};
use crate::target::{parse_target, ProbeTarget};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Why a prober declined a target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceptError {
    /// The scheme belongs to another prober.
    #[error("target not accepted")]
    NotAccepted,
    /// The scheme is ours but the target can't be probed.
    #[error("invalid target {target:?}: {reason}")]
    Invalid { target: String, reason: String },
}

impl AcceptError {
    pub(crate) fn invalid(target: &ProbeTarget, reason: impl Into<String>) -> Self {
        AcceptError::Invalid {
            target: target.raw().to_string(),
            reason: reason.into(),
        }
    }
}

/// Result of one probe attempt against one target.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        rtt: Duration,
        detail: Option<ProbeDetail>,
    },
    Timeout(String),
    Failed {
        message: String,
        detail: Option<ProbeDetail>,
    },
}

impl Outcome {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Outcome::Failed {
            message: message.into(),
            detail: None,
        }
    }

    /// Classify an I/O error as a timeout or a plain failure.
    pub(crate) fn from_io(context: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Outcome::Timeout(format!("{}: {}", context, err))
            }
            _ => Outcome::failed(format!("{}: {}", context, err)),
        }
    }

    pub fn into_event(self, key: String, sent_at: chrono::DateTime<Utc>) -> Event {
        match self {
            Outcome::Success { rtt, detail } => {
                Event::success(key, sent_at, rtt).with_detail(detail)
            }
            Outcome::Timeout(message) => Event::timeout(key, sent_at, message),
            Outcome::Failed { message, detail } => {
                Event::failed(key, sent_at, message).with_detail(detail)
            }
        }
    }
}

/// A protocol prober. The set of protocols is closed.
#[derive(Debug)]
pub enum Prober {
    Icmp(IcmpProber),
    Http(HttpProber),
    Tcp(TcpProber),
    Dns(DnsProber),
    Ntp(NtpProber),
}

impl Prober {
    /// Build the prober bound to scheme `name`.
    pub fn from_config(name: &str, config: &ProberConfig) -> Result<Self, ProbeError> {
        let prober = match config {
            ProberConfig::Icmpv4(cfg) => {
                Prober::Icmp(IcmpProber::new(name, IpFamily::V4, cfg.clone()))
            }
            ProberConfig::Icmpv6(cfg) => {
                Prober::Icmp(IcmpProber::new(name, IpFamily::V6, cfg.clone()))
            }
            ProberConfig::Http(cfg) => Prober::Http(HttpProber::new(name, cfg.clone())?),
            ProberConfig::Tcp(cfg) => Prober::Tcp(TcpProber::new(name, cfg.clone())),
            ProberConfig::Dns(cfg) => Prober::Dns(DnsProber::new(name, cfg.clone())),
            ProberConfig::Ntp(cfg) => Prober::Ntp(NtpProber::new(name, cfg.clone())),
        };
        Ok(prober)
    }

    /// Whether a prober built from `config` under `name` would own `scheme`.
    ///
    /// Native schemes belong only to the entry named after its protocol.
    pub fn claims(name: &str, config: &ProberConfig, scheme: &str) -> bool {
        scheme == name
            || (name == config.protocol() && native_schemes(config).contains(&scheme))
    }

    pub fn name(&self) -> &str {
        match self {
            Prober::Icmp(p) => p.name(),
            Prober::Http(p) => p.name(),
            Prober::Tcp(p) => p.name(),
            Prober::Dns(p) => p.name(),
            Prober::Ntp(p) => p.name(),
        }
    }

    /// Offer a target string; returns its display name when taken.
    pub fn accept(&mut self, input: &str) -> Result<String, AcceptError> {
        let target = parse_target(input).map_err(|e| AcceptError::Invalid {
            target: input.trim().to_string(),
            reason: e.to_string(),
        })?;

        match self {
            Prober::Icmp(p) => p.accept(&target),
            Prober::Http(p) => p.accept(&target),
            Prober::Tcp(p) => p.accept(&target),
            Prober::Dns(p) => p.accept(&target),
            Prober::Ntp(p) => p.accept(&target),
        }
    }

    pub fn has_targets(&self) -> bool {
        self.target_count() > 0
    }

    pub fn target_count(&self) -> usize {
        match self {
            Prober::Icmp(p) => p.target_count(),
            Prober::Http(p) => p.target_count(),
            Prober::Tcp(p) => p.target_count(),
            Prober::Dns(p) => p.target_count(),
            Prober::Ntp(p) => p.target_count(),
        }
    }

    /// Drop targets accepted after the first `len`.
    pub(crate) fn truncate_targets(&mut self, len: usize) {
        match self {
            Prober::Icmp(p) => p.truncate_targets(len),
            Prober::Http(p) => p.truncate_targets(len),
            Prober::Tcp(p) => p.truncate_targets(len),
            Prober::Dns(p) => p.truncate_targets(len),
            Prober::Ntp(p) => p.truncate_targets(len),
        }
    }

    /// Probe every target each `interval` until [`Prober::stop`] is called.
    pub async fn start(
        &self,
        events: mpsc::Sender<Event>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        match self {
            Prober::Icmp(p) => p.start(events, interval, timeout).await,
            Prober::Http(p) => p.start(events, interval, timeout).await,
            Prober::Tcp(p) => p.start(events, interval, timeout).await,
            Prober::Dns(p) => p.start(events, interval, timeout).await,
            Prober::Ntp(p) => p.start(events, interval, timeout).await,
        }
    }

    /// Stop probing and wait for in-flight attempts to finish.
    pub async fn stop(&self) {
        match self {
            Prober::Icmp(p) => p.stop().await,
            Prober::Http(p) => p.stop().await,
            Prober::Tcp(p) => p.stop().await,
            Prober::Dns(p) => p.stop().await,
            Prober::Ntp(p) => p.stop().await,
        }
    }
}

fn native_schemes(config: &ProberConfig) -> &'static [&'static str] {
    match config {
        ProberConfig::Icmpv4(_) => &["icmpv4"],
        ProberConfig::Icmpv6(_) => &["icmpv6"],
        ProberConfig::Http(_) => &["http", "https"],
        ProberConfig::Tcp(_) => &["tcp"],
        ProberConfig::Dns(_) => &["dns"],
        ProberConfig::Ntp(_) => &["ntp"],
    }
}

/// Start/stop signalling shared by every prober.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    stop: watch::Sender<bool>,
    running: watch::Sender<bool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            stop: watch::channel(false).0,
            running: watch::channel(false).0,
        }
    }

    /// Mark the prober running; the guard clears the flag when dropped.
    pub(crate) fn begin(&self) -> (watch::Receiver<bool>, RunningGuard<'_>) {
        self.running.send_replace(true);
        (self.stop.subscribe(), RunningGuard(self))
    }

    pub(crate) async fn stop(&self) {
        self.stop.send_replace(true);
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|r| !*r).await;
    }
}

pub(crate) struct RunningGuard<'a>(&'a Lifecycle);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.send_replace(false);
    }
}

/// Wait until the stop flag is raised.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

/// Tick loop shared by the connection-oriented probers.
///
/// Each tick spawns one attempt per target. An attempt emits `Sent`, runs
/// under `deadline`, then emits exactly one terminal event. On stop the loop
/// joins every attempt before returning.
pub(crate) async fn run_rounds<T, F, Fut>(
    protocol: &'static str,
    lifecycle: &Lifecycle,
    targets: Vec<(String, T)>,
    events: mpsc::Sender<Event>,
    interval: Duration,
    deadline: Duration,
    attempt: F,
) where
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    let (mut stop, _running) = lifecycle.begin();
    let mut tasks = JoinSet::new();

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("{} prober: probing {} targets every {:?}", protocol, targets.len(), interval);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = ticker.tick() => {
                while let Some(joined) = tasks.try_join_next() {
                    if let Err(e) = joined {
                        tracing::warn!("{} probe task failed: {}", protocol, e);
                    }
                }

                for (key, target) in &targets {
                    let key = key.clone();
                    let target = target.clone();
                    let events = events.clone();
                    let attempt = attempt.clone();

                    tasks.spawn(async move {
                        let sent_at = Utc::now();
                        if events.send(Event::sent(key.clone(), sent_at)).await.is_err() {
                            return;
                        }

                        let outcome = match tokio::time::timeout(deadline, attempt(target)).await {
                            Ok(outcome) => outcome,
                            Err(_) => Outcome::Timeout(format!("timed out after {:?}", deadline)),
                        };
                        tracing::debug!("{} probe {}: {:?}", protocol, key, outcome);

                        if events.send(outcome.into_event(key, sent_at)).await.is_err() {
                            tracing::warn!("{} prober: event channel closed", protocol);
                        }
                    });
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!("{} probe task failed: {}", protocol, e);
        }
    }
    tracing::info!("{} prober: stopped", protocol);
}

/// Bind `socket` to a local address or, on Linux, a device name.
pub(crate) fn bind_source(socket: &Socket, source: &str, family: IpFamily) -> std::io::Result<()> {
    if let Ok(ip) = source.parse::<IpAddr>() {
        if IpFamily::of(ip) != family {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("source address {} does not match the target family", ip),
            ));
        }
        return socket.bind(&SocketAddr::new(ip, 0).into());
    }

    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    {
        socket.bind_device(Some(source.as_bytes()))
    }

    #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("binding to device {:?} is not supported on this platform", source),
        ))
    }
}

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}
