//! HTTP probe implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use tokio::sync::mpsc;

use super::{run_rounds, AcceptError, Lifecycle, Outcome, ProbeError};
use crate::codes::match_code;
use crate::config::HttpConfig;
use crate::event::{Event, ProbeDetail};
use crate::target::ProbeTarget;

/// GETs each target and checks status and, optionally, body.
#[derive(Debug)]
pub struct HttpProber {
    name: String,
    config: Arc<HttpConfig>,
    client: reqwest::Client,
    targets: Vec<(String, Url)>,
    lifecycle: Lifecycle,
}

impl HttpProber {
    pub fn new(name: &str, config: HttpConfig) -> Result<Self, ProbeError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ProbeError::Config(format!("invalid header name {:?}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| {
                    ProbeError::Config(format!("invalid value for header {:?}: {}", key, e))
                })?;
            headers.insert(header, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(config.skip_tls_verify);
        if config.disable_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }
        let client = builder
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            config: Arc::new(config),
            client,
            targets: Vec::new(),
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accept(&mut self, target: &ProbeTarget) -> Result<String, AcceptError> {
        let scheme = match target.scheme() {
            "http" | "https" => target.scheme(),
            other if other == self.name => {
                if self.config.secure {
                    "https"
                } else {
                    "http"
                }
            }
            _ => return Err(AcceptError::NotAccepted),
        };

        let key = target.raw().to_string();
        if self.targets.iter().any(|(k, _)| *k == key) {
            return Ok(key);
        }

        let url = request_url(scheme, target)
            .map_err(|e| AcceptError::invalid(target, format!("invalid URL: {}", e)))?;
        self.targets.push((key.clone(), url));
        Ok(key)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub(crate) fn truncate_targets(&mut self, len: usize) {
        self.targets.truncate(len);
    }

    /// Whether `code` counts as success under this prober's configuration.
    pub fn is_expected_status_code(&self, code: u16) -> bool {
        is_expected_status(&self.config, code)
    }

    pub async fn start(
        &self,
        events: mpsc::Sender<Event>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        let client = self.client.clone();
        let config = self.config.clone();

        run_rounds(
            "http",
            &self.lifecycle,
            self.targets.clone(),
            events,
            interval,
            timeout,
            move |url| fetch(client.clone(), url, config.clone(), timeout),
        )
        .await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

/// Status expectation: the pattern if set, else the exact code if set,
/// else any 2xx.
pub fn is_expected_status(config: &HttpConfig, code: u16) -> bool {
    if let Some(pattern) = config.expect_codes.as_deref().filter(|p| !p.trim().is_empty()) {
        return match_code(u32::from(code), pattern);
    }
    match config.expect_code {
        Some(expected) => code == expected,
        None => (200..=299).contains(&code),
    }
}

fn request_url(scheme: &str, target: &ProbeTarget) -> Result<Url, String> {
    let mut url = if target.host().contains(':') {
        format!("{}://[{}]", scheme, target.host())
    } else {
        format!("{}://{}", scheme, target.host())
    };
    if let Some(port) = target.port() {
        url.push_str(&format!(":{}", port));
    }
    url.push_str(target.path());
    // the query string is passed through as typed
    if let Some((_, query)) = target.raw().split_once('?') {
        if !target.query().is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }
    Url::parse(&url).map_err(|e| e.to_string())
}

/// One GET against `url`.
///
/// RTT covers the full body transfer.
async fn fetch(
    client: reqwest::Client,
    url: Url,
    config: Arc<HttpConfig>,
    timeout: Duration,
) -> Outcome {
    let start = Instant::now();

    let response = match client.get(url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return Outcome::Timeout(e.to_string()),
        Err(e) => return Outcome::failed(e.to_string()),
    };

    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) if e.is_timeout() => return Outcome::Timeout(e.to_string()),
        Err(e) => return Outcome::failed(e.to_string()),
    };
    let rtt = start.elapsed();
    let detail = Some(ProbeDetail::Http { status });

    if !is_expected_status(&config, status) {
        return Outcome::Failed {
            message: format!("unexpected status code {}", status),
            detail,
        };
    }

    if let Some(expected) = &config.expect_body {
        if body.trim() != expected {
            return Outcome::Failed {
                message: "response body does not match".to_string(),
                detail,
            };
        }
    }

    Outcome::Success { rtt, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_target;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    fn test_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn test_expected_status() {
        let cfg = HttpConfig {
            expect_codes: Some("2XX".to_string()),
            ..Default::default()
        };
        assert!(is_expected_status(&cfg, 204));
        assert!(!is_expected_status(&cfg, 301));

        let cfg = HttpConfig {
            expect_code: Some(301),
            ..Default::default()
        };
        assert!(is_expected_status(&cfg, 301));
        assert!(!is_expected_status(&cfg, 200));

        // the pattern wins over the exact code
        let cfg = HttpConfig {
            expect_code: Some(301),
            expect_codes: Some("200".to_string()),
            ..Default::default()
        };
        assert!(is_expected_status(&cfg, 200));
        assert!(!is_expected_status(&cfg, 301));

        let cfg = HttpConfig::default();
        assert!(is_expected_status(&cfg, 200));
        assert!(is_expected_status(&cfg, 299));
        assert!(!is_expected_status(&cfg, 404));
    }

    #[test]
    fn test_prober_status_expectation() {
        let prober = HttpProber::new(
            "http",
            HttpConfig {
                expect_codes: Some("2XX".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(prober.is_expected_status_code(204));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let mut config = HttpConfig::default();
        config.headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(HttpProber::new("http", config), Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_accept() {
        let mut prober = HttpProber::new(
            "api",
            HttpConfig {
                secure: true,
                ..Default::default()
            },
        )
        .unwrap();

        let t = parse_target("https://example.com/health?full=1").unwrap();
        assert_eq!(prober.accept(&t).unwrap(), "https://example.com/health?full=1");
        assert_eq!(prober.targets[0].1.as_str(), "https://example.com/health?full=1");

        let t = parse_target("api://example.com:8443/status").unwrap();
        prober.accept(&t).unwrap();
        assert_eq!(prober.targets[1].1.as_str(), "https://example.com:8443/status");

        let t = parse_target("tcp://example.com:80").unwrap();
        assert_eq!(prober.accept(&t), Err(AcceptError::NotAccepted));
        assert_eq!(prober.target_count(), 2);
    }

    #[test]
    fn test_query_is_requested_as_written() {
        let mut prober = HttpProber::new("search", HttpConfig::default()).unwrap();

        let t = parse_target("http://example.com/search?tag=b&tag=a&z=1&a=2").unwrap();
        prober.accept(&t).unwrap();
        assert_eq!(
            prober.targets[0].1.as_str(),
            "http://example.com/search?tag=b&tag=a&z=1&a=2"
        );

        let t = parse_target("search://example.com:8080/q?b=2&a=1&b=3").unwrap();
        prober.accept(&t).unwrap();
        assert_eq!(
            prober.targets[1].1.as_str(),
            "http://example.com:8080/q?b=2&a=1&b=3"
        );
    }

    #[tokio::test]
    async fn test_no_content_is_success_for_2xx() {
        let addr = serve("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let config = Arc::new(HttpConfig {
            expect_codes: Some("2XX".to_string()),
            ..Default::default()
        });
        let url = Url::parse(&format!("http://{}/", addr)).unwrap();

        match fetch(test_client(), url, config, Duration::from_secs(2)).await {
            Outcome::Success { detail, .. } => {
                assert_eq!(detail, Some(ProbeDetail::Http { status: 204 }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_body_mismatch_fails() {
        let addr =
            serve("HTTP/1.1 200 OK\r\nContent-Length: 9\r\nConnection: close\r\n\r\ndegraded\n")
                .await;
        let url = Url::parse(&format!("http://{}/", addr)).unwrap();

        let config = Arc::new(HttpConfig {
            expect_body: Some("ok".to_string()),
            ..Default::default()
        });
        let outcome = fetch(test_client(), url.clone(), config, Duration::from_secs(2)).await;
        assert!(matches!(outcome, Outcome::Failed { ref message, .. } if message.contains("body")));

        let config = Arc::new(HttpConfig {
            expect_body: Some("degraded".to_string()),
            ..Default::default()
        });
        let outcome = fetch(test_client(), url, config, Duration::from_secs(2)).await;
        assert!(matches!(outcome, Outcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_unexpected_status_fails() {
        let addr = serve(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let url = Url::parse(&format!("http://{}/", addr)).unwrap();
        let config = Arc::new(HttpConfig::default());
        let outcome = fetch(test_client(), url, config, Duration::from_secs(2)).await;
        match outcome {
            Outcome::Failed { message, detail } => {
                assert!(message.contains("503"));
                assert_eq!(detail, Some(ProbeDetail::Http { status: 503 }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let url = Url::parse(&format!("http://{}/", addr)).unwrap();
        let config = Arc::new(HttpConfig::default());
        let outcome = fetch(test_client(), url, config, Duration::from_millis(200)).await;
        assert!(matches!(outcome, Outcome::Timeout(_)));
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let url = Url::parse("http://invalid.invalid").unwrap();
        let config = Arc::new(HttpConfig::default());
        let outcome = fetch(test_client(), url, config, Duration::from_millis(500)).await;
        assert!(!matches!(outcome, Outcome::Success { .. }));
    }
}
