//! DNS probe implementation using raw query packets over UDP or TCP.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use super::{run_rounds, AcceptError, Lifecycle, Outcome, ProbeError};
use crate::codes::match_code;
use crate::config::DnsConfig;
use crate::event::{Event, ProbeDetail};
use crate::target::ProbeTarget;

/// Response codes accepted when no pattern is configured.
const DEFAULT_RCODES: &str = "0";

/// Query types the prober can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Any,
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Any => 255,
        }
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::Ns),
            "CNAME" => Ok(RecordType::Cname),
            "SOA" => Ok(RecordType::Soa),
            "PTR" => Ok(RecordType::Ptr),
            "MX" => Ok(RecordType::Mx),
            "TXT" => Ok(RecordType::Txt),
            "AAAA" => Ok(RecordType::Aaaa),
            "SRV" => Ok(RecordType::Srv),
            "ANY" => Ok(RecordType::Any),
            other => Err(format!("unknown record type {:?}", other)),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::Ns => "NS",
            RecordType::Cname => "CNAME",
            RecordType::Soa => "SOA",
            RecordType::Ptr => "PTR",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Aaaa => "AAAA",
            RecordType::Srv => "SRV",
            RecordType::Any => "ANY",
        };
        f.write_str(s)
    }
}

/// A fully resolved DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub record_type: RecordType,
    pub server: SocketAddr,
    pub use_tcp: bool,
}

/// Queries a resolver for each target name.
#[derive(Debug)]
pub struct DnsProber {
    name: String,
    config: DnsConfig,
    targets: Vec<(String, DnsQuery)>,
    lifecycle: Lifecycle,
}

impl DnsProber {
    pub fn new(name: &str, config: DnsConfig) -> Self {
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

    /// Accept `dns://<name>[:port][?type=..&server=..&tcp=..]`.
    ///
    /// The host is the name queried; the port and query parameters select
    /// the resolver and override the configured defaults.
    pub fn accept(&mut self, target: &ProbeTarget) -> Result<String, AcceptError> {
        if target.scheme() != "dns" && target.scheme() != self.name {
            return Err(AcceptError::NotAccepted);
        }

        let key = target.raw().to_string();
        if self.targets.iter().any(|(k, _)| *k == key) {
            return Ok(key);
        }

        let record_type = target
            .query_param("type")
            .unwrap_or(self.config.record_type.as_str())
            .parse::<RecordType>()
            .map_err(|e| AcceptError::invalid(target, e))?;

        let use_tcp = match target.query_param("tcp") {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "" | "1" | "true" | "yes"),
            None => self.config.use_tcp,
        };

        let server_host = target.query_param("server").unwrap_or(self.config.server.as_str());
        let port = target.port().unwrap_or(self.config.port);
        let server = resolve_server(server_host, port)
            .map_err(|e| AcceptError::invalid(target, e))?;

        let name = target.host().trim_end_matches('.').to_string();
        build_query(&name, record_type).map_err(|e| AcceptError::invalid(target, e))?;

        self.targets.push((
            key.clone(),
            DnsQuery {
                name,
                record_type,
                server,
                use_tcp,
            },
        ));
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
        let pattern: Arc<str> = Arc::from(
            self.config
                .expect_rcodes
                .as_deref()
                .unwrap_or(DEFAULT_RCODES),
        );

        run_rounds(
            "dns",
            &self.lifecycle,
            self.targets.clone(),
            events,
            interval,
            timeout,
            move |query| exchange(query, pattern.clone()),
        )
        .await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

fn resolve_server(host: &str, port: u16) -> Result<SocketAddr, String> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err("no DNS server configured".to_string());
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve DNS server {}: {}", host, e))?
        .next()
        .ok_or_else(|| format!("no addresses found for DNS server {}", host))
}

/// One query/response exchange, judged against the rcode `pattern`.
async fn exchange(query: DnsQuery, pattern: Arc<str>) -> Outcome {
    let (tx_id, packet) = match build_query(&query.name, query.record_type) {
        Ok(built) => built,
        Err(e) => return Outcome::failed(e),
    };

    let result = if query.use_tcp {
        exchange_tcp(query.server, &packet).await
    } else {
        exchange_udp(query.server, tx_id, &packet).await
    };

    let (response, rtt) = match result {
        Ok(r) => r,
        Err(e) => return Outcome::from_io("DNS exchange failed", e),
    };

    let header = match parse_header(&response, tx_id) {
        Ok(header) => header,
        Err(e) => return Outcome::failed(e),
    };

    let detail = Some(ProbeDetail::Dns {
        rcode: header.rcode,
        answers: header.answers,
    });

    if match_code(u32::from(header.rcode), &pattern) {
        Outcome::Success { rtt, detail }
    } else {
        Outcome::Failed {
            message: format!("DNS error RCODE: {} ({})", header.rcode, rcode_name(header.rcode)),
            detail,
        }
    }
}

async fn exchange_udp(
    server: SocketAddr,
    tx_id: u16,
    packet: &[u8],
) -> std::io::Result<(Vec<u8>, Duration)> {
    let bind: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;

    let start = Instant::now();
    socket.send(packet).await?;

    let mut response = [0u8; 4096];
    loop {
        let n = socket.recv(&mut response).await?;
        // Stray datagrams for other queries are skipped
        if n >= 2 && u16::from_be_bytes([response[0], response[1]]) == tx_id {
            return Ok((response[..n].to_vec(), start.elapsed()));
        }
    }
}

async fn exchange_tcp(server: SocketAddr, packet: &[u8]) -> std::io::Result<(Vec<u8>, Duration)> {
    let mut stream = TcpStream::connect(server).await?;

    let start = Instant::now();
    let len = u16::try_from(packet.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too long"))?;
    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(packet);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut response = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    stream.read_exact(&mut response).await?;

    Ok((response, start.elapsed()))
}

/// The parts of a response header the probe looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub rcode: u8,
    pub answers: u16,
}

fn parse_header(response: &[u8], tx_id: u16) -> Result<DnsHeader, String> {
    if response.len() < 12 {
        return Err(format!("response too short: {} bytes", response.len()));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        ));
    }

    if response[2] & 0x80 == 0 {
        return Err("reply is not a response".to_string());
    }

    Ok(DnsHeader {
        // RCODE is the lower 4 bits of byte 3
        rcode: response[3] & 0x0F,
        answers: u16::from_be_bytes([response[6], response[7]]),
    })
}

fn rcode_name(rcode: u8) -> &'static str {
    match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}

/// Build a query packet for `name`, returning the transaction id with it.
fn build_query(name: &str, record_type: RecordType) -> Result<(u16, Vec<u8>), String> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired
    let qd_count: u16 = 1;

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(18 + name.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&qd_count.to_be_bytes());
    packet.extend_from_slice(&[0; 6]); // AN, NS, AR counts

    // Domain name encoding: length-prefixed labels
    let mut encoded = 0;
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(format!("label {:?} longer than 63 bytes", label));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
        encoded += label.len() + 1;
    }
    if encoded + 1 > 255 {
        return Err(format!("name {:?} longer than 255 bytes", name));
    }
    packet.push(0); // Null terminator

    packet.extend_from_slice(&record_type.code().to_be_bytes());
    // QCLASS: IN (1)
    packet.extend_from_slice(&1u16.to_be_bytes());

    Ok((tx_id, packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_target;

    /// Answer every query with `rcode` and one fake answer.
    async fn fake_resolver(rcode: u8) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let mut reply = buf[..n].to_vec();
                reply[2] |= 0x80;
                reply[3] = (reply[3] & 0xF0) | rcode;
                reply[6..8].copy_from_slice(&1u16.to_be_bytes());
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr
    }

    fn query_for(server: SocketAddr) -> DnsQuery {
        DnsQuery {
            name: "example.com".to_string(),
            record_type: RecordType::A,
            server,
            use_tcp: false,
        }
    }

    #[test]
    fn test_build_dns_query() {
        let (tx_id, packet) = build_query("example.com", RecordType::Aaaa).unwrap();
        // 12 (header) + 13 (question name) + 4 (type/class)
        assert_eq!(packet.len(), 29);
        assert_eq!(u16::from_be_bytes([packet[0], packet[1]]), tx_id);
        assert_eq!(packet[12], 7);
        assert_eq!(&packet[25..27], &28u16.to_be_bytes());

        assert!(build_query(&"a".repeat(64), RecordType::A).is_err());
    }

    #[test]
    fn test_record_types() {
        assert_eq!("aaaa".parse::<RecordType>(), Ok(RecordType::Aaaa));
        assert_eq!("MX".parse::<RecordType>().unwrap().code(), 15);
        assert!("BOGUS".parse::<RecordType>().is_err());
        assert_eq!(RecordType::Txt.to_string(), "TXT");
    }

    #[test]
    fn test_parse_header() {
        let mut response = vec![0u8; 12];
        response[0..2].copy_from_slice(&0xABCDu16.to_be_bytes());
        response[2] = 0x81;
        response[3] = 0x83;
        response[7] = 2;

        let header = parse_header(&response, 0xABCD).unwrap();
        assert_eq!(header, DnsHeader { rcode: 3, answers: 2 });

        assert!(parse_header(&response, 0x1111).is_err());
        assert!(parse_header(&response[..8], 0xABCD).is_err());
        response[2] = 0x01;
        assert!(parse_header(&response, 0xABCD).is_err());
    }

    #[test]
    fn test_accept_overrides() {
        let mut prober = DnsProber::new("dns", DnsConfig::default());

        let t = parse_target("dns://example.com:5353?type=AAAA&server=127.0.0.1&tcp=true").unwrap();
        prober.accept(&t).unwrap();
        let query = &prober.targets[0].1;
        assert_eq!(query.name, "example.com");
        assert_eq!(query.record_type, RecordType::Aaaa);
        assert_eq!(query.server, "127.0.0.1:5353".parse().unwrap());
        assert!(query.use_tcp);

        let t = parse_target("dns://example.com?type=WAT&server=127.0.0.1").unwrap();
        assert!(matches!(prober.accept(&t), Err(AcceptError::Invalid { .. })));

        let t = parse_target("dns://example.com?server=no-such-host.invalid").unwrap();
        assert!(matches!(prober.accept(&t), Err(AcceptError::Invalid { .. })));

        let t = parse_target("ntp://example.com").unwrap();
        assert_eq!(prober.accept(&t), Err(AcceptError::NotAccepted));
    }

    #[tokio::test]
    async fn test_noerror_is_success() {
        let server = fake_resolver(0).await;
        match exchange(query_for(server), Arc::from(DEFAULT_RCODES)).await {
            Outcome::Success { detail, .. } => {
                assert_eq!(detail, Some(ProbeDetail::Dns { rcode: 0, answers: 1 }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nxdomain_fails_unless_expected() {
        let server = fake_resolver(3).await;

        let outcome = exchange(query_for(server), Arc::from(DEFAULT_RCODES)).await;
        assert!(matches!(
            outcome,
            Outcome::Failed { ref message, .. } if message.contains("NXDOMAIN")
        ));

        let outcome = exchange(query_for(server), Arc::from("0,3")).await;
        assert!(matches!(outcome, Outcome::Success { .. }));
    }
}
