//! TCP connect probe implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;

use super::{bind_source, run_rounds, AcceptError, IpFamily, Lifecycle, Outcome, ProbeError};
use crate::config::TcpConfig;
use crate::event::Event;
use crate::target::ProbeTarget;

/// A `host:port` to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTarget {
    pub host: String,
    pub port: u16,
}

/// Opens and immediately closes a connection to each target.
#[derive(Debug)]
pub struct TcpProber {
    name: String,
    config: TcpConfig,
    targets: Vec<(String, TcpTarget)>,
    lifecycle: Lifecycle,
}

impl TcpProber {
    pub fn new(name: &str, config: TcpConfig) -> Self {
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
        if target.scheme() != "tcp" && target.scheme() != self.name {
            return Err(AcceptError::NotAccepted);
        }

        let port = target
            .port_or_default()
            .ok_or_else(|| AcceptError::invalid(target, "missing port"))?;
        if port == 0 {
            return Err(AcceptError::invalid(target, "port cannot be 0"));
        }

        let key = target.raw().to_string();
        if !self.targets.iter().any(|(k, _)| *k == key) {
            self.targets.push((
                key.clone(),
                TcpTarget {
                    host: target.host().to_string(),
                    port,
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
        let deadline = self.config.dial_timeout().unwrap_or(timeout);
        let source: Option<Arc<str>> = self.config.source_interface.as_deref().map(Arc::from);

        run_rounds(
            "tcp",
            &self.lifecycle,
            self.targets.clone(),
            events,
            interval,
            deadline,
            move |target| dial(target, source.clone()),
        )
        .await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

/// Connect once; RTT is the connect time, excluding name resolution.
async fn dial(target: TcpTarget, source: Option<Arc<str>>) -> Outcome {
    let addr = match tokio::net::lookup_host((target.host.as_str(), target.port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => return Outcome::failed(format!("no addresses found for {}", target.host)),
        },
        Err(e) => return Outcome::failed(format!("DNS resolution failed: {}", e)),
    };

    let start = Instant::now();
    let connected = match source.as_deref() {
        None => TcpStream::connect(addr).await,
        Some(source) => connect_from(addr, source).await,
    };

    match connected {
        Ok(stream) => {
            let rtt = start.elapsed();
            drop(stream);
            Outcome::Success { rtt, detail: None }
        }
        Err(e) => Outcome::from_io("connect failed", e),
    }
}

async fn connect_from(addr: SocketAddr, source: &str) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    bind_source(&socket, source, IpFamily::of(addr.ip()))?;
    socket.set_nonblocking(true)?;
    let std_stream: std::net::TcpStream = socket.into();
    TcpSocket::from_std_stream(std_stream).connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_target;
    use tokio::net::TcpListener;

    #[test]
    fn test_accept_requires_port() {
        let mut prober = TcpProber::new("tcp", TcpConfig::default());

        let t = parse_target("tcp://example.com:22").unwrap();
        assert_eq!(prober.accept(&t).unwrap(), "tcp://example.com:22");

        let t = parse_target("tcp://example.com").unwrap();
        assert!(matches!(prober.accept(&t), Err(AcceptError::Invalid { .. })));

        let t = parse_target("http://example.com:80").unwrap();
        assert_eq!(prober.accept(&t), Err(AcceptError::NotAccepted));

        assert_eq!(prober.target_count(), 1);
    }

    #[tokio::test]
    async fn test_dial_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });

        let outcome = dial(
            TcpTarget {
                host: "127.0.0.1".to_string(),
                port,
            },
            None,
        )
        .await;
        assert!(matches!(outcome, Outcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_dial_from_source_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });

        let outcome = dial(
            TcpTarget {
                host: "127.0.0.1".to_string(),
                port,
            },
            Some(Arc::from("127.0.0.1")),
        )
        .await;
        assert!(matches!(outcome, Outcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_dial_closed_port_fails() {
        // grab a free port, then close it
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let outcome = dial(
            TcpTarget {
                host: "127.0.0.1".to_string(),
                port,
            },
            None,
        )
        .await;
        assert!(matches!(outcome, Outcome::Failed { .. }));
    }
}
