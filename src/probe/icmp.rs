//! ICMP echo prober.
//!
//! One socket per prober. Each tick sends an echo request to every target
//! with the round counter as sequence number and the process identifier in
//! the payload, then sweeps rounds that outlived the timeout. A single
//! blocking receive loop matches replies back to rounds.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::sync::mpsc;

use super::{
    bind_source, stopped, AcceptError, IpFamily, Lifecycle, ProbeError, RoundTable, RoundTarget,
};
use crate::config::IcmpConfig;
use crate::event::Event;
use crate::target::ProbeTarget;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// How long a blocking receive waits before re-checking for shutdown.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Identifier shared by every ICMP prober in this process.
pub fn process_identifier() -> u16 {
    static IDENTIFIER: OnceLock<u16> = OnceLock::new();
    *IDENTIFIER.get_or_init(rand::random)
}

/// ICMP echo prober for one address family.
#[derive(Debug)]
pub struct IcmpProber {
    name: String,
    family: IpFamily,
    config: IcmpConfig,
    targets: Vec<RoundTarget>,
    lifecycle: Lifecycle,
}

impl IcmpProber {
    pub fn new(name: &str, family: IpFamily, config: IcmpConfig) -> Self {
        Self {
            name: name.to_string(),
            family,
            config,
            targets: Vec::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn native_scheme(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "icmpv4",
            IpFamily::V6 => "icmpv6",
        }
    }

    pub fn accept(&mut self, target: &ProbeTarget) -> Result<String, AcceptError> {
        if target.scheme() != self.name && target.scheme() != self.native_scheme() {
            return Err(AcceptError::NotAccepted);
        }

        let key = target.raw().to_string();
        if self.targets.iter().any(|t| t.key == key) {
            return Ok(key);
        }

        let addr = self.resolve(target)?;
        self.targets.push(RoundTarget::new(key.clone(), addr));
        Ok(key)
    }

    fn resolve(&self, target: &ProbeTarget) -> Result<IpAddr, AcceptError> {
        if let Some(ip) = target.ip() {
            if IpFamily::of(ip) != self.family {
                return Err(AcceptError::invalid(
                    target,
                    format!("{} is not an {} address", ip, self.native_scheme()),
                ));
            }
            return Ok(ip);
        }

        let addrs = (target.host(), 0)
            .to_socket_addrs()
            .map_err(|e| AcceptError::invalid(target, format!("DNS resolution failed: {}", e)))?;

        addrs
            .map(|sa| sa.ip())
            .find(|ip| IpFamily::of(*ip) == self.family)
            .ok_or_else(|| {
                AcceptError::invalid(
                    target,
                    format!("no {} address for {}", self.native_scheme(), target.host()),
                )
            })
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
        let (mut stop, _running) = self.lifecycle.begin();

        let socket = Arc::new(open_socket(self.family, &self.config)?);
        let identifier = process_identifier();
        let table = Arc::new(Mutex::new(RoundTable::new()));
        let halt = Arc::new(AtomicBool::new(false));

        let mut receiver = {
            let socket = socket.clone();
            let table = table.clone();
            let events = events.clone();
            let halt = halt.clone();
            let family = self.family;
            tokio::task::spawn_blocking(move || {
                receive_loop(&socket, family, identifier, &table, &events, &halt)
            })
        };
        let mut receiver_done = false;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut counter: u64 = 0;

        tracing::info!(
            "{} prober: probing {} targets every {:?} (identifier {:#06x})",
            self.name,
            self.targets.len(),
            interval,
            identifier
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break Ok(()),
                joined = &mut receiver => {
                    receiver_done = true;
                    break Err(match joined {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => ProbeError::Transport("receive loop exited".to_string()),
                        Err(e) => ProbeError::Transport(format!("receive loop failed: {}", e)),
                    });
                }
                _ = ticker.tick() => {
                    let expired = lock(&table).sweep(Instant::now(), timeout);
                    emit_timeouts(&events, expired, timeout).await;

                    let sent = self
                        .send_round(&socket, &table, &events, counter, identifier, timeout)
                        .await;
                    if let Err(e) = sent {
                        break Err(e);
                    }
                    counter += 1;
                }
            }
        };

        if result.is_ok() {
            // rounds in flight get their full timeout to collect replies
            let deadline = Instant::now() + timeout;
            loop {
                let open = !lock(&table).is_empty();
                if !open || Instant::now() >= deadline || receiver.is_finished() {
                    break;
                }
                tokio::time::sleep(RECV_POLL).await;
            }
        }
        let remaining = lock(&table).close_all();
        emit_timeouts(&events, remaining, timeout).await;

        halt.store(true, Ordering::Relaxed);
        if !receiver_done {
            match receiver.await {
                Ok(Err(e)) if result.is_ok() => return Err(e),
                Err(e) => tracing::warn!("{} prober: receive loop failed: {}", self.name, e),
                _ => {}
            }
        }

        if let Err(e) = &result {
            tracing::error!("{} prober: {}", self.name, e);
        } else {
            tracing::info!("{} prober: stopped", self.name);
        }
        result
    }

    async fn send_round(
        &self,
        socket: &Arc<Socket>,
        table: &Arc<Mutex<RoundTable>>,
        events: &mpsc::Sender<Event>,
        counter: u64,
        identifier: u16,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        let sequence = counter as u16;
        let packet =
            build_echo_request(self.family, identifier, sequence, self.config.body.as_bytes());

        let sent_at = Utc::now();
        for target in &self.targets {
            let _ = events.send(Event::sent(target.key.clone(), sent_at)).await;
        }

        let evicted = lock(table).open(counter, Instant::now(), sent_at, &self.targets);
        emit_timeouts(events, evicted, timeout).await;

        let failures = {
            let socket = socket.clone();
            let targets = self.targets.clone();
            tokio::task::spawn_blocking(move || {
                targets
                    .into_iter()
                    .filter_map(|t| {
                        let dest = SockAddr::from(SocketAddr::new(t.addr, 0));
                        socket.send_to(&packet, &dest).err().map(|e| (t.key, e))
                    })
                    .collect::<Vec<_>>()
            })
            .await
            .map_err(|e| ProbeError::Transport(format!("send task failed: {}", e)))?
        };

        for (key, err) in failures {
            tracing::debug!("{} prober: send to {} failed: {}", self.name, key, err);
            let settled = lock(table).settle(counter, &key);
            if settled {
                let _ = events
                    .send(Event::failed(key, sent_at, format!("failed to send: {}", err)))
                    .await;
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

fn lock(table: &Mutex<RoundTable>) -> MutexGuard<'_, RoundTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn emit_timeouts(
    events: &mpsc::Sender<Event>,
    expired: Vec<super::Expired>,
    timeout: Duration,
) {
    for e in expired {
        let message = format!("no reply within {:?}", timeout);
        let _ = events.send(Event::timeout(e.key, e.sent_at, message)).await;
    }
}

/// Open the ICMP socket, preferring RAW (privileged) over DGRAM.
fn open_socket(family: IpFamily, config: &IcmpConfig) -> Result<Socket, ProbeError> {
    let (domain, protocol) = match family {
        IpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
        IpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Transport(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(RECV_POLL))
        .map_err(|e| ProbeError::Transport(format!("failed to set timeout: {}", e)))?;

    if let Some(ttl) = config.ttl {
        let applied = match family {
            IpFamily::V4 => socket.set_ttl(u32::from(ttl)),
            IpFamily::V6 => socket.set_unicast_hops_v6(u32::from(ttl)),
        };
        applied.map_err(|e| ProbeError::Transport(format!("failed to set TTL: {}", e)))?;
    }

    if let Some(tos) = config.tos {
        match family {
            IpFamily::V4 => socket
                .set_tos(u32::from(tos))
                .map_err(|e| ProbeError::Transport(format!("failed to set TOS: {}", e)))?,
            IpFamily::V6 => tracing::warn!("TOS is not applied to ICMPv6 sockets"),
        }
    }

    if let Some(source) = &config.source_interface {
        bind_source(&socket, source, family)
            .map_err(|e| {
                ProbeError::Transport(format!("failed to bind to {}: {}", source, e))
            })?;
    }

    Ok(socket)
}

/// Read replies until `halt` is raised or the socket breaks.
fn receive_loop(
    socket: &Socket,
    family: IpFamily,
    identifier: u16,
    table: &Mutex<RoundTable>,
    events: &mpsc::Sender<Event>,
    halt: &AtomicBool,
) -> Result<(), ProbeError> {
    let mut buf = [MaybeUninit::<u8>::uninit(); 2048];

    while !halt.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(ProbeError::Transport(format!("failed to receive: {}", e))),
        };
        let now = Instant::now();

        // SAFETY: recv_from initialized the first `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let Some(reply) = parse_echo_reply(family, data) else {
            continue;
        };
        if reply.identifier != identifier {
            continue;
        }
        let Some(from) = from.as_socket().map(|sa| sa.ip()) else {
            continue;
        };

        let acked = lock(table).acknowledge(reply.sequence, from, now);
        for ack in acked {
            let _ = events.blocking_send(Event::success(ack.key, ack.sent_at, ack.rtt));
        }
    }

    Ok(())
}

/// The fields of an echo reply used for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
}

/// Build an echo request. The payload starts with `identifier` so replies
/// can be recognized even when the kernel rewrites the header id (DGRAM
/// sockets).
pub fn build_echo_request(
    family: IpFamily,
    identifier: u16,
    sequence: u16,
    body: &[u8],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(10 + body.len());

    packet.push(match family {
        IpFamily::V4 => ICMPV4_ECHO_REQUEST,
        IpFamily::V6 => ICMPV6_ECHO_REQUEST,
    });
    packet.push(0); // Code
    packet.extend_from_slice(&[0, 0]); // Checksum
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(body);

    // The kernel computes the ICMPv6 checksum
    if family == IpFamily::V4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Parse an echo reply, skipping an IPv4 header if the socket delivered one.
pub fn parse_echo_reply(family: IpFamily, data: &[u8]) -> Option<EchoReply> {
    let (offset, reply_type) = match family {
        IpFamily::V4 => {
            let first = *data.first()?;
            let offset = if first >> 4 == 4 {
                usize::from(first & 0x0F) * 4
            } else {
                0
            };
            (offset, ICMPV4_ECHO_REPLY)
        }
        IpFamily::V6 => (0, ICMPV6_ECHO_REPLY),
    };

    let icmp = data.get(offset..)?;
    if icmp.len() < 10 || icmp[0] != reply_type {
        return None;
    }

    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp[8], icmp[9]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_target;

    #[test]
    fn test_icmp_checksum() {
        let packet = build_echo_request(IpFamily::V4, 0x1234, 0x0001, b"hello");
        // A packet with its checksum filled in sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_echo_request(IpFamily::V4, 0x1234, 0x0001, b"");
        assert_eq!(packet.len(), 10);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
        assert_eq!(packet[8..10], [0x12, 0x34]); // Payload identifier

        let packet = build_echo_request(IpFamily::V6, 0x1234, 0x0002, b"x");
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
        assert_eq!(packet.len(), 11);
    }

    #[test]
    fn test_parse_reply_dgram() {
        let mut reply = build_echo_request(IpFamily::V4, 0xBEEF, 42, b"payload");
        reply[0] = ICMPV4_ECHO_REPLY;
        // kernel-assigned header id differs, payload identifier survives
        reply[4..6].copy_from_slice(&0x0101u16.to_be_bytes());

        let parsed = parse_echo_reply(IpFamily::V4, &reply).unwrap();
        assert_eq!(parsed, EchoReply { identifier: 0xBEEF, sequence: 42 });
    }

    #[test]
    fn test_parse_reply_raw_with_ip_header() {
        let mut icmp = build_echo_request(IpFamily::V4, 0xBEEF, 7, b"");
        icmp[0] = ICMPV4_ECHO_REPLY;
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        datagram.extend_from_slice(&icmp);

        let parsed = parse_echo_reply(IpFamily::V4, &datagram).unwrap();
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.identifier, 0xBEEF);
    }

    #[test]
    fn test_parse_ignores_requests_and_short_packets() {
        let request = build_echo_request(IpFamily::V4, 1, 1, b"");
        assert!(parse_echo_reply(IpFamily::V4, &request).is_none());
        assert!(parse_echo_reply(IpFamily::V4, &[0, 0, 0]).is_none());
        assert!(parse_echo_reply(IpFamily::V6, &[]).is_none());

        let mut reply = build_echo_request(IpFamily::V6, 9, 3, b"");
        reply[0] = ICMPV6_ECHO_REPLY;
        assert_eq!(parse_echo_reply(IpFamily::V6, &reply).unwrap().sequence, 3);
    }

    #[test]
    fn test_identifier_is_stable() {
        assert_eq!(process_identifier(), process_identifier());
    }

    #[test]
    fn test_accept() {
        let mut prober = IcmpProber::new("icmpv4", IpFamily::V4, IcmpConfig::default());

        let target = parse_target("10.0.0.1").unwrap();
        assert_eq!(prober.accept(&target).unwrap(), "10.0.0.1");
        let target = parse_target("icmpv4:10.0.0.2").unwrap();
        assert_eq!(prober.accept(&target).unwrap(), "icmpv4:10.0.0.2");
        // duplicate
        let target = parse_target("10.0.0.1").unwrap();
        prober.accept(&target).unwrap();
        assert_eq!(prober.target_count(), 2);

        let target = parse_target("::1").unwrap();
        assert_eq!(prober.accept(&target), Err(AcceptError::NotAccepted));
        let target = parse_target("http://10.0.0.1").unwrap();
        assert_eq!(prober.accept(&target), Err(AcceptError::NotAccepted));

        let target = parse_target("icmpv4://[::1]").unwrap();
        assert!(matches!(prober.accept(&target), Err(AcceptError::Invalid { .. })));
    }

    #[test]
    fn test_custom_name_accepts_its_scheme() {
        let mut prober = IcmpProber::new("core", IpFamily::V6, IcmpConfig::default());
        let target = parse_target("core://[2001:db8::1]").unwrap();
        assert!(prober.accept(&target).is_ok());
        let target = parse_target("icmpv6:2001:db8::2").unwrap();
        assert!(prober.accept(&target).is_ok());
        assert_eq!(prober.target_count(), 2);
    }
}
