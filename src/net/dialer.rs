//! Dual-stack TCP dialer
//!
//! Resolves a host to its full A/AAAA set, sorts IPv4 first, and tries
//! each address in turn with a per-attempt timeout and a short fallback
//! delay between attempts. The last error is kept for reporting.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::net::resolver::{self, IpFamily};

/// Per-address connect timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between address attempts.
pub const FALLBACK_DELAY: Duration = Duration::from_millis(300);

#[derive(Error, Debug)]
pub enum DialError {
    #[error("{0}")]
    Resolve(#[from] resolver::ResolveError),

    #[error("no IP addresses found for host: {0}")]
    NoAddresses(String),

    #[error("all IP addresses failed. Last error: {0}")]
    AllFailed(String),
}

/// Sequential dual-stack dialer.
#[derive(Debug, Clone)]
pub struct DualStackDialer {
    pub timeout: Duration,
    pub fallback_delay: Duration,
    pub prefer_ipv4: bool,
}

impl Default for DualStackDialer {
    fn default() -> Self {
        Self {
            timeout: DIAL_TIMEOUT,
            fallback_delay: FALLBACK_DELAY,
            prefer_ipv4: true,
        }
    }
}

impl DualStackDialer {
    /// Connect to `host:port`, trying each resolved address in order.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let addrs = self.resolve_sorted(host).await?;

        let mut last_err = String::new();
        for ip in &addrs {
            match tokio::time::timeout(self.timeout, TcpStream::connect((*ip, port))).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = format!("connect to {ip} timed out"),
            }
            tokio::time::sleep(self.fallback_delay).await;
        }
        Err(DialError::AllFailed(last_err))
    }

    /// Resolve `host` and return its addresses in dial order.
    pub async fn resolve_sorted(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        let mut addrs = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![ip]
        } else {
            resolver::lookup_host(host).await?
        };
        if addrs.is_empty() {
            return Err(DialError::NoAddresses(host.to_string()));
        }
        if self.prefer_ipv4 {
            addrs.sort_by_key(|ip| match IpFamily::of(ip) {
                IpFamily::V4 => 0u8,
                IpFamily::V6 => 1u8,
            });
        }
        Ok(addrs)
    }
}
