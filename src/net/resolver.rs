//! Host and URL resolution
//!
//! Normalizes a free-form target specifier (bare host, `host:port`, or a
//! full URL) into `(ip, host, port, version)`, picking the v4/v6 address
//! by preference. Also exposes the public-IP probe used during
//! registration.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;

use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::net::http::{Http, RequestData};

/// Hostname gate: labels of 1-63 chars, at least one dot, sane TLD.
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9][a-z0-9-]{0,61}[a-z0-9]$")
        .expect("domain regex")
});

/// Resolution errors
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("lookup failed for {host}: {message}")]
    Lookup { host: String, message: String },

    #[error("public IP request failed: {0}")]
    PublicIp(String),
}

/// Address family of a resolved target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Wire label used in acknowledgement frames.
    pub fn label(&self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        }
    }

    /// Key used in the `ip.prefer` setting and the public-IP endpoint.
    pub fn prefer_key(&self) -> &'static str {
        match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        }
    }

    pub fn from_prefer(value: &str) -> Option<Self> {
        match value {
            "ipv4" => Some(Self::V4),
            "ipv6" => Some(Self::V6),
            _ => None,
        }
    }

    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A normalized probe target.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub ip: IpAddr,
    pub host: String,
    pub port: u16,
    pub version: IpFamily,
}

/// Normalize `input` into a resolved target.
///
/// URL forms take the hostname and port from the URL (443/80 scheme
/// defaults); otherwise the input is split into host and port with 80 as
/// the fallback. Hosts that are not IP literals must pass the domain
/// gate before a DNS lookup is attempted.
pub async fn filter_ip(
    input: &str,
    prefer: Option<IpFamily>,
) -> Result<ResolvedTarget, ResolveError> {
    let (host, port) = if input.starts_with("http://") || input.starts_with("https://") {
        let url =
            Url::parse(input).map_err(|_| ResolveError::InvalidUrl(input.to_string()))?;
        let host = match url.host() {
            Some(url::Host::Domain(d)) => d.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(ResolveError::InvalidUrl(input.to_string())),
        };
        let port = url
            .port()
            .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
        (host, port)
    } else {
        split_host_port(input)
    };

    let (ip, version) = parse_domain_ip(&host, prefer).await?;
    Ok(ResolvedTarget {
        ip,
        host,
        port,
        version,
    })
}

/// Split `host[:port]`, defaulting the port to 80.
///
/// Handles bracketed IPv6 (`[::1]:443`) and bare IPv6 literals (which
/// carry no port).
fn split_host_port(input: &str) -> (String, u16) {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if input.parse::<IpAddr>().is_ok() {
        return (input.to_string(), 80);
    }
    if let Some((host, port)) = input.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    (input.to_string(), 80)
}

/// Resolve `host` to a single address: IP literals pass through, domains
/// go through DNS with the preferred family picked first.
pub async fn parse_domain_ip(
    host: &str,
    prefer: Option<IpFamily>,
) -> Result<(IpAddr, IpFamily), ResolveError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok((ip, IpFamily::of(&ip)));
    }
    if !DOMAIN_RE.is_match(&host.to_lowercase()) {
        return Err(ResolveError::InvalidAddress(host.to_string()));
    }
    let ip = domain_to_ip(host, prefer).await?;
    Ok((ip, IpFamily::of(&ip)))
}

async fn domain_to_ip(domain: &str, prefer: Option<IpFamily>) -> Result<IpAddr, ResolveError> {
    let ips = lookup_host(domain).await?;
    if let Some(family) = prefer {
        if let Some(ip) = ips.iter().find(|ip| IpFamily::of(ip) == family) {
            return Ok(*ip);
        }
    }
    ips.first()
        .copied()
        .ok_or_else(|| ResolveError::InvalidDomain(domain.to_string()))
}

/// Resolve every A/AAAA address of `host`.
pub async fn lookup_host(host: &str) -> Result<Vec<IpAddr>, ResolveError> {
    let lookup = dual_stack_resolver()
        .lookup_ip(host)
        .await
        .map_err(|e| ResolveError::Lookup {
            host: host.to_string(),
            message: e.to_string(),
        })?;
    let ips: Vec<IpAddr> = lookup.iter().collect();
    if ips.is_empty() {
        return Err(ResolveError::InvalidDomain(host.to_string()));
    }
    Ok(ips)
}

/// Shared resolver configured to return both address families.
pub(crate) fn dual_stack_resolver() -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
    TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
}

#[derive(Debug, Deserialize)]
struct PublicIpBody {
    ip: Option<String>,
}

/// Ask the public-IP endpoint for this host's address over a
/// family-restricted connection. `None` queries the dual-stack endpoint.
pub async fn public_ip(
    family: Option<IpFamily>,
    user_agent: &str,
) -> Result<String, ResolveError> {
    let api = match family {
        Some(IpFamily::V4) => "ipv4",
        Some(IpFamily::V6) => "ipv6",
        None => "ip",
    };
    let http = Http {
        url: format!("https://{api}.001000.best"),
        method: reqwest::Method::GET,
        data: Some(RequestData::Form(vec![(
            "format".to_string(),
            "json".to_string(),
        )])),
        timeout: Duration::from_secs(10),
        family,
        identity: None,
        user_agent: user_agent.to_string(),
    };
    let body = http
        .url_request()
        .await
        .map_err(|e| ResolveError::PublicIp(e.to_string()))?;
    let parsed: PublicIpBody =
        serde_json::from_str(&body).map_err(|e| ResolveError::PublicIp(e.to_string()))?;
    parsed
        .ip
        .ok_or_else(|| ResolveError::PublicIp("response carried no address".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_gate() {
        assert!(DOMAIN_RE.is_match("example.com"));
        assert!(DOMAIN_RE.is_match("a.b.example.co"));
        assert!(!DOMAIN_RE.is_match("localhost"));
        assert!(!DOMAIN_RE.is_match("-bad.example.com"));
        assert!(!DOMAIN_RE.is_match("example..com"));
        assert!(!DOMAIN_RE.is_match("host_name.example.com"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443"), ("example.com".into(), 443));
        assert_eq!(split_host_port("example.com"), ("example.com".into(), 80));
        assert_eq!(split_host_port("1.1.1.1:8080"), ("1.1.1.1".into(), 8080));
        assert_eq!(split_host_port("1.1.1.1"), ("1.1.1.1".into(), 80));
        assert_eq!(split_host_port("::1"), ("::1".into(), 80));
        assert_eq!(split_host_port("[::1]:443"), ("::1".into(), 443));
    }

    #[tokio::test]
    async fn test_filter_ip_literal() {
        let target = filter_ip("1.1.1.1", None).await.unwrap();
        assert_eq!(target.ip.to_string(), "1.1.1.1");
        assert_eq!(target.port, 80);
        assert_eq!(target.version, IpFamily::V4);
    }

    #[tokio::test]
    async fn test_filter_ip_v6_literal_with_port() {
        let target = filter_ip("[2606:4700::1111]:853", None).await.unwrap();
        assert_eq!(target.version, IpFamily::V6);
        assert_eq!(target.port, 853);
    }

    #[tokio::test]
    async fn test_filter_ip_url_defaults() {
        let target = filter_ip("https://93.184.216.34/path", None).await.unwrap();
        assert_eq!(target.port, 443);
        let target = filter_ip("http://93.184.216.34", None).await.unwrap();
        assert_eq!(target.port, 80);
    }

    #[tokio::test]
    async fn test_filter_ip_rejects_garbage_host() {
        let err = filter_ip("not a host", None).await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidAddress(_)));
    }

    #[test]
    fn test_family_labels() {
        assert_eq!(IpFamily::V4.label(), "IPv4");
        assert_eq!(IpFamily::V6.prefer_key(), "ipv6");
        assert_eq!(IpFamily::from_prefer("ipv4"), Some(IpFamily::V4));
        assert_eq!(IpFamily::from_prefer(""), None);
    }
}
