//! NTP probe implementation: a single client-mode SNTP exchange per target.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::{run_rounds, AcceptError, Lifecycle, Outcome, ProbeError};
use crate::config::NtpConfig;
use crate::event::{Event, ProbeDetail};
use crate::target::ProbeTarget;

pub const NTP_PORT: u16 = 123;

/// Seconds between the NTP era (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const PACKET_LEN: usize = 48;
const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;

/// Where and how to ask for the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpTarget {
    pub host: String,
    pub port: u16,
    pub version: u8,
    pub max_offset: Option<Duration>,
}

/// The fields of a server reply the probe reports on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpReply {
    pub stratum: u8,
    pub mode: u8,
    /// Server transmit time, seconds since the Unix epoch
    pub transmit: f64,
}

#[derive(Debug)]
pub struct NtpProber {
    name: String,
    config: NtpConfig,
    targets: Vec<(String, NtpTarget)>,
    lifecycle: Lifecycle,
}

impl NtpProber {
    pub fn new(name: &str, config: NtpConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            targets: Vec::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accept(&mut self, target: &ProbeTarget) -> Result<String, AcceptError> {
        if target.scheme() != "ntp" && target.scheme() != self.name {
            return Err(AcceptError::NotAccepted);
        }
        if !matches!(self.config.version, 3 | 4) {
            return Err(AcceptError::invalid(
                target,
                format!("unsupported NTP version {}", self.config.version),
            ));
        }

        let key = target.raw().to_string();
        if !self.targets.iter().any(|(k, _)| *k == key) {
            let host = self
                .config
                .server
                .clone()
                .unwrap_or_else(|| target.host().to_string());
            let port = target.port().or(self.config.port).unwrap_or(NTP_PORT);
            self.targets.push((
                key.clone(),
                NtpTarget {
                    host,
                    port,
                    version: self.config.version,
                    max_offset: self.config.max_offset(),
                },
            ));
        }
        Ok(key)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub(crate) fn truncate_targets(&mut self, len: usize) {
        self.targets.truncate(len);
    }

    pub async fn start(
        &self,
        events: mpsc::Sender<Event>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        run_rounds(
            "ntp",
            &self.lifecycle,
            self.targets.clone(),
            events,
            interval,
            timeout,
            query,
        )
        .await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

/// Ask `target` for the time once.
async fn query(target: NtpTarget) -> Outcome {
    let addr = match tokio::net::lookup_host((target.host.as_str(), target.port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => return Outcome::failed(format!("no addresses found for {}", target.host)),
        },
        Err(e) => return Outcome::failed(format!("DNS resolution failed: {}", e)),
    };

    let (reply, sent, rtt) = match exchange(addr, target.version).await {
        Ok(r) => r,
        Err(e) => return Outcome::from_io("NTP exchange failed", e),
    };

    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => return Outcome::failed(e),
    };

    if reply.mode != MODE_SERVER {
        return Outcome::failed(format!("unexpected NTP mode {}", reply.mode));
    }

    let offset = clock_offset(sent, rtt, reply.transmit);
    let detail = Some(ProbeDetail::Ntp {
        offset_ms: offset * 1000.0,
        stratum: reply.stratum,
    });

    if reply.stratum == 0 {
        return Outcome::Failed {
            message: "server is unsynchronized (stratum 0)".to_string(),
            detail,
        };
    }

    if let Some(max) = target.max_offset {
        if offset.abs() > max.as_secs_f64() {
            return Outcome::Failed {
                message: format!(
                    "clock offset {:.3}ms exceeds {}ms",
                    offset * 1000.0,
                    max.as_millis()
                ),
                detail,
            };
        }
    }

    Outcome::Success { rtt, detail }
}

type Exchanged = (Result<NtpReply, String>, f64, Duration);

async fn exchange(addr: SocketAddr, version: u8) -> std::io::Result<Exchanged> {
    let bind: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let sent = unix_now();
    let start = Instant::now();
    socket.send(&build_request(version, sent)).await?;

    let mut buf = [0u8; 512];
    let n = socket.recv(&mut buf).await?;
    let rtt = start.elapsed();

    Ok((parse_reply(&buf[..n]), sent, rtt))
}

/// Offset of the server clock from ours, in seconds.
///
/// Assumes the reply spent half the round trip on the way back.
pub fn clock_offset(sent: f64, rtt: Duration, server_transmit: f64) -> f64 {
    server_transmit - (sent + rtt.as_secs_f64() / 2.0)
}

/// A client request carrying `transmit` (Unix seconds) as its transmit time.
pub fn build_request(version: u8, transmit: f64) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    // LI = 0, VN = version, Mode = client
    packet[0] = ((version & 0x07) << 3) | MODE_CLIENT;
    packet[40..48].copy_from_slice(&to_ntp_timestamp(transmit).to_be_bytes());
    packet
}

pub fn parse_reply(data: &[u8]) -> Result<NtpReply, String> {
    if data.len() < PACKET_LEN {
        return Err(format!("reply too short: {} bytes", data.len()));
    }

    let mut transmit = [0u8; 8];
    transmit.copy_from_slice(&data[40..48]);
    Ok(NtpReply {
        mode: data[0] & 0x07,
        stratum: data[1],
        transmit: from_ntp_timestamp(u64::from_be_bytes(transmit)),
    })
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Unix seconds to a 32.32 fixed-point NTP timestamp.
pub fn to_ntp_timestamp(unix: f64) -> u64 {
    let ntp = unix + NTP_UNIX_OFFSET as f64;
    let secs = ntp.trunc() as u64;
    let frac = (ntp.fract() * 4_294_967_296.0) as u64;
    (secs << 32) | (frac & 0xFFFF_FFFF)
}

pub fn from_ntp_timestamp(ts: u64) -> f64 {
    let secs = (ts >> 32) as f64 - NTP_UNIX_OFFSET as f64;
    let frac = (ts & 0xFFFF_FFFF) as f64 / 4_294_967_296.0;
    secs + frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_target;

    /// Reply with `stratum`, stamping our clock shifted by `skew` seconds.
    async fn fake_server(stratum: u8, skew: f64) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                let mut reply = [0u8; PACKET_LEN];
                reply[0] = (4 << 3) | MODE_SERVER;
                reply[1] = stratum;
                reply[40..48].copy_from_slice(&to_ntp_timestamp(unix_now() + skew).to_be_bytes());
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr
    }

    fn target_for(addr: SocketAddr, max_offset: Option<Duration>) -> NtpTarget {
        NtpTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            version: 4,
            max_offset,
        }
    }

    #[test]
    fn test_timestamp_conversion() {
        let unix = 1_700_000_000.25;
        let ts = to_ntp_timestamp(unix);
        assert_eq!(ts >> 32, 1_700_000_000 + NTP_UNIX_OFFSET);
        assert!((from_ntp_timestamp(ts) - unix).abs() < 1e-6);
    }

    #[test]
    fn test_request_layout() {
        let packet = build_request(4, 0.0);
        assert_eq!(packet[0], 0x23);
        assert_eq!(u64::from_be_bytes(packet[40..48].try_into().unwrap()) >> 32, NTP_UNIX_OFFSET);

        assert_eq!(build_request(3, 0.0)[0], 0x1B);
    }

    #[test]
    fn test_parse_reply() {
        assert!(parse_reply(&[0u8; 20]).is_err());

        let mut data = [0u8; PACKET_LEN];
        data[0] = 0x24;
        data[1] = 2;
        let reply = parse_reply(&data).unwrap();
        assert_eq!(reply.mode, MODE_SERVER);
        assert_eq!(reply.stratum, 2);
    }

    #[test]
    fn test_clock_offset() {
        let offset = clock_offset(100.0, Duration::from_millis(20), 100.5);
        assert!((offset - 0.49).abs() < 1e-9);
    }

    #[test]
    fn test_accept() {
        let mut prober = NtpProber::new("ntp", NtpConfig::default());
        let t = parse_target("ntp://pool.ntp.org").unwrap();
        prober.accept(&t).unwrap();
        assert_eq!(prober.targets[0].1.host, "pool.ntp.org");
        assert_eq!(prober.targets[0].1.port, NTP_PORT);

        let mut prober = NtpProber::new(
            "clock",
            NtpConfig {
                server: Some("127.0.0.1".to_string()),
                port: Some(1123),
                ..Default::default()
            },
        );
        let t = parse_target("clock://anything").unwrap();
        prober.accept(&t).unwrap();
        assert_eq!(prober.targets[0].1.host, "127.0.0.1");
        assert_eq!(prober.targets[0].1.port, 1123);

        let t = parse_target("dns://example.com").unwrap();
        assert_eq!(prober.accept(&t), Err(AcceptError::NotAccepted));
    }

    #[test]
    fn test_accept_rejects_old_versions() {
        let t = parse_target("ntp://pool.ntp.org").unwrap();
        for version in [1, 2, 5] {
            let mut prober = NtpProber::new(
                "ntp",
                NtpConfig {
                    version,
                    ..Default::default()
                },
            );
            assert!(matches!(prober.accept(&t), Err(AcceptError::Invalid { .. })));
            assert_eq!(prober.target_count(), 0);
        }

        let mut prober = NtpProber::new(
            "ntp",
            NtpConfig {
                version: 3,
                ..Default::default()
            },
        );
        assert!(prober.accept(&t).is_ok());
    }

    #[tokio::test]
    async fn test_query_success() {
        let addr = fake_server(2, 0.0).await;
        match query(target_for(addr, Some(Duration::from_secs(1)))).await {
            Outcome::Success { detail: Some(ProbeDetail::Ntp { stratum, offset_ms }), .. } => {
                assert_eq!(stratum, 2);
                assert!(offset_ms.abs() < 1000.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stratum_zero_fails() {
        let addr = fake_server(0, 0.0).await;
        let outcome = query(target_for(addr, None)).await;
        assert!(matches!(
            outcome,
            Outcome::Failed { ref message, .. } if message.contains("stratum")
        ));
    }

    #[tokio::test]
    async fn test_offset_limit() {
        let addr = fake_server(1, 30.0).await;

        let outcome = query(target_for(addr, Some(Duration::from_secs(5)))).await;
        assert!(matches!(
            outcome,
            Outcome::Failed { ref message, .. } if message.contains("offset")
        ));

        let outcome = query(target_for(addr, None)).await;
        assert!(matches!(outcome, Outcome::Success { .. }));
    }
}
