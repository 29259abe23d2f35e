//! Target string parsing.
//!
//! Three input shapes are recognized, in this order:
//! 1. legacy `icmpv4:host` / `icmpv6:host` (no `://`)
//! 2. URL form `scheme://host[:port][/path][?query]`
//! 3. a bare host name or IP literal, probed over ICMP

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Schemes accepted in the legacy `scheme:host` shape.
const LEGACY_SCHEMES: [&str; 2] = ["icmpv4", "icmpv6"];

/// Target parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("empty target")]
    Empty,
    #[error("invalid scheme {0:?}")]
    InvalidScheme(String),
    #[error("missing host in {0:?}")]
    MissingHost(String),
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// A parsed probe destination.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    /// Query pairs in input order, repeats kept
    query: Vec<(String, String)>,
    raw: String,
}

impl ProbeTarget {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port written in the target, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The explicit port, falling back to the scheme's well-known port.
    pub fn port_or_default(&self) -> Option<u16> {
        self.port.or_else(|| default_port(&self.scheme))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First value given for `key`.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The input string this target was parsed from, trimmed.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

}

impl PartialEq for ProbeTarget {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.host == other.host
            && self.port == other.port
            && self.path == other.path
            && self.query == other.query
    }
}

impl Eq for ProbeTarget {}

impl fmt::Display for ProbeTarget {
    /// Canonical URL form; parsing it again yields an equal target.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        f.write_str(&self.path)?;
        if !self.query.is_empty() {
            let query: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

/// Well-known port for a scheme.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "dns" => Some(53),
        "ntp" => Some(123),
        _ => None,
    }
}

/// Check that `scheme` is usable as a URL scheme.
pub fn is_valid_scheme(scheme: &str) -> bool {
    static SCHEME: OnceLock<Regex> = OnceLock::new();
    let re = SCHEME.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*$").unwrap());
    re.is_match(scheme)
}

/// Parse a target string.
pub fn parse_target(input: &str) -> Result<ProbeTarget, TargetError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TargetError::Empty);
    }

    if let Some((scheme, rest)) = trimmed.split_once("://") {
        return parse_url(trimmed, scheme, rest);
    }

    if let Some((scheme, rest)) = trimmed.split_once(':') {
        let scheme = scheme.to_ascii_lowercase();
        if LEGACY_SCHEMES.contains(&scheme.as_str()) {
            return parse_legacy(trimmed, scheme, rest);
        }
    }

    Ok(parse_bare(trimmed))
}

fn parse_url(raw: &str, scheme: &str, rest: &str) -> Result<ProbeTarget, TargetError> {
    if !is_valid_scheme(scheme) {
        return Err(TargetError::InvalidScheme(scheme.to_string()));
    }

    let (before_query, query) = match rest.split_once('?') {
        Some((before, query)) => (before, parse_query(query)),
        None => (rest, Vec::new()),
    };

    let (authority, path) = match before_query.find('/') {
        Some(idx) => before_query.split_at(idx),
        None => (before_query, ""),
    };

    let (host, port) = split_authority(raw, authority)?;

    Ok(ProbeTarget {
        scheme: scheme.to_ascii_lowercase(),
        host,
        port,
        path: path.to_string(),
        query,
        raw: raw.to_string(),
    })
}

fn parse_legacy(raw: &str, scheme: String, rest: &str) -> Result<ProbeTarget, TargetError> {
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let (host, port) = split_authority(raw, authority)?;

    Ok(ProbeTarget {
        scheme,
        host,
        port,
        path: path.to_string(),
        query: Vec::new(),
        raw: raw.to_string(),
    })
}

fn parse_bare(raw: &str) -> ProbeTarget {
    let host = raw
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(raw);

    let scheme = if host.parse::<Ipv6Addr>().is_ok() {
        "icmpv6"
    } else {
        "icmpv4"
    };

    ProbeTarget {
        scheme: scheme.to_string(),
        host: host.to_string(),
        port: None,
        path: String::new(),
        query: Vec::new(),
        raw: raw.to_string(),
    }
}

/// Split `host[:port]`, handling bracketed and bare IPv6 literals.
fn split_authority(raw: &str, authority: &str) -> Result<(String, Option<u16>), TargetError> {
    if authority.is_empty() {
        return Err(TargetError::MissingHost(raw.to_string()));
    }

    if let Some(inner) = authority.strip_prefix('[') {
        let (host, after) = inner
            .split_once(']')
            .ok_or_else(|| TargetError::InvalidHost(authority.to_string()))?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(TargetError::InvalidHost(host.to_string()));
        }
        let port = match after {
            "" => None,
            _ => match after.strip_prefix(':') {
                Some(port) => Some(parse_port(port)?),
                None => return Err(TargetError::InvalidHost(authority.to_string())),
            },
        };
        return Ok((host.to_string(), port));
    }

    if authority.parse::<Ipv6Addr>().is_ok() {
        return Ok((authority.to_string(), None));
    }

    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (host, Some(parse_port(port)?)),
        None => (authority, None),
    };

    if host.is_empty() {
        return Err(TargetError::MissingHost(raw.to_string()));
    }
    if host
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '@' | '[' | ']' | ':' | '#'))
    {
        return Err(TargetError::InvalidHost(host.to_string()));
    }

    Ok((host.to_string(), port))
}

fn parse_port(port: &str) -> Result<u16, TargetError> {
    port.parse()
        .map_err(|_| TargetError::InvalidPort(port.to_string()))
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
