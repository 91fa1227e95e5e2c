//! Web speed probe
//!
//! A phase-timed HTTP GET issued directly over TCP/TLS so every window
//! (dns, connect, ssl, wait, download, redirect) is measured at the
//! socket. The first request is pinned to the address resolved during
//! preprocessing while SNI and the Host header keep the original name;
//! redirects to other hosts resolve normally. Download is bounded by
//! both a size cap and a time cap.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

use crate::config::RuntimeConfig;
use crate::net::resolver;
use crate::probes::{Prepared, ProbeError, ProbeHandler, ResultSender};

const MAX_REDIRECTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DOWNLOAD_SIZE: u64 = 2 * 1024 * 1024;
const MAX_DOWNLOAD_TIME: Duration = Duration::from_secs(8);
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Desktop and mobile user agents rotated across tests so probe traffic
/// blends with ordinary browsing.
const USER_AGENTS: [&str; 9] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Linux; Android 14; SM-G998B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
];

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

#[derive(Debug, Deserialize)]
struct WebspeedRequest {
    content: String,
    #[serde(rename = "type")]
    _kind: String,
    #[serde(rename = "taskId")]
    task_id: String,
    #[serde(rename = "clientIP", default)]
    client_ip: Option<String>,
}

/// Measured phases of one speed test.
#[derive(Debug, Default)]
pub struct WebSpeedResult {
    pub http_code: u16,
    pub total_time: f64,
    pub dns_time: f64,
    pub connect_time: f64,
    pub ssl_time: f64,
    pub wait_time: f64,
    pub download_time: f64,
    pub download_size: u64,
    pub download_speed: f64,
    pub redirect_count: u32,
    pub redirect_time: f64,
    pub http_headers: String,
}

/// Handler for `request-webspeed` tasks.
pub struct WebspeedHandler {
    runtime: Arc<RuntimeConfig>,
}

impl WebspeedHandler {
    pub fn new(runtime: Arc<RuntimeConfig>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ProbeHandler for WebspeedHandler {
    fn task_type(&self) -> &'static str {
        "webspeed"
    }

    fn validate(&self, data: &Value) -> Result<(), ProbeError> {
        let request: WebspeedRequest =
            serde_json::from_value(data.clone()).map_err(|_| ProbeError::InvalidData)?;
        if let Some(client_ip) = request.client_ip {
            info!("{} Webspeed", client_ip);
        }
        Ok(())
    }

    async fn preprocess(&self, data: Value) -> Result<Prepared, ProbeError> {
        let request: WebspeedRequest =
            serde_json::from_value(data.clone()).map_err(|_| ProbeError::InvalidData)?;

        let content = clean_content(&request.content);
        let target = resolver::filter_ip(&content, self.runtime.ip_prefer()).await?;

        let ack = json!({
            "ip": target.ip.to_string(),
            "port": target.port.to_string(),
            "ipVersion": target.version.label(),
            "taskType": self.task_type(),
            "taskId": request.task_id,
        });

        let mut enriched = data;
        if let Some(map) = enriched.as_object_mut() {
            map.insert("ip".to_string(), json!(target.ip.to_string()));
            map.insert("url".to_string(), json!(content));
        }

        Ok(Prepared {
            data: enriched,
            ack,
        })
    }

    async fn execute(
        &self,
        data: &Value,
        task_id: &str,
        stop: watch::Receiver<bool>,
        sender: Arc<dyn ResultSender>,
    ) -> Result<(), ProbeError> {
        if *stop.borrow() {
            return Err(ProbeError::Stopped(task_id.to_string()));
        }

        let url = data
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or(ProbeError::InvalidData)?;
        let ip: IpAddr = data
            .get("ip")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or(ProbeError::InvalidData)?;

        match web_speed_test(url, ip).await {
            Err(e) => {
                let error_result = json!({
                    "error": e.to_string(),
                    "taskType": self.task_type(),
                    "taskId": task_id,
                });
                sender.send("agent-response", &error_result).await;
            }
            Ok(result) => {
                let body = json!({
                    "httpCode": result.http_code,
                    "totalTime": result.total_time,
                    "dnsTime": result.dns_time,
                    "connectTime": result.connect_time,
                    "sslTime": result.ssl_time,
                    "waitTime": result.wait_time,
                    "downloadTime": result.download_time,
                    "downloadSize": result.download_size,
                    "downloadSpeed": result.download_speed,
                    "redirectCount": result.redirect_count,
                    "redirectTime": result.redirect_time,
                    "httpHeaders": result.http_headers,
                    "taskType": self.task_type(),
                    "taskId": task_id,
                });
                sender.send("agent-response", &body).await;
            }
        }
        Ok(())
    }
}

/// Strip whitespace, quotes, and surrounding brackets from the target.
fn clean_content(content: &str) -> String {
    let trimmed = content.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        trimmed
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    } else {
        trimmed.to_string()
    }
}

fn pick_user_agent() -> &'static str {
    let mut b = [0u8; 1];
    let _ = getrandom::fill(&mut b);
    USER_AGENTS[b[0] as usize % USER_AGENTS.len()]
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn url_host(url: &Url) -> Result<String, ProbeError> {
    match url.host() {
        Some(url::Host::Domain(d)) => Ok(d.to_string()),
        Some(url::Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(url::Host::Ipv6(ip)) => Ok(ip.to_string()),
        None => Err(ProbeError::Probe(format!("url has no host: {url}"))),
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

struct ResponseHead {
    status_line: String,
    code: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Raw status line and header lines as captured from the wire.
    fn raw_text(&self) -> String {
        let mut text = String::with_capacity(256);
        text.push_str(&self.status_line);
        text.push('\n');
        for (k, v) in &self.headers {
            text.push_str(k);
            text.push_str(": ");
            text.push_str(v);
            text.push('\n');
        }
        text
    }
}

fn parse_head(bytes: &[u8]) -> Result<ResponseHead, ProbeError> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| ProbeError::Probe("empty response head".to_string()))?
        .to_string();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ProbeError::Probe(format!("bad status line: {status_line}")))?;
    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    Ok(ResponseHead {
        status_line,
        code,
        headers,
    })
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Read until the header/body boundary. Returns the head bytes and any
/// body bytes that arrived in the same reads.
async fn read_head(
    stream: &mut Box<dyn IoStream>,
    deadline: Instant,
    first_byte: &mut Option<Instant>,
) -> Result<(Vec<u8>, Vec<u8>), ProbeError> {
    let mut buf: Vec<u8> = Vec::with_capacity(2048);
    let mut chunk = [0u8; 8192];
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| ProbeError::Probe("request timed out".to_string()))?;
        let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
            .await
            .map_err(|_| ProbeError::Probe("request timed out".to_string()))?
            .map_err(|e| ProbeError::Probe(format!("read error: {e}")))?;
        if n == 0 {
            return Err(ProbeError::Probe(
                "connection closed before headers".to_string(),
            ));
        }
        if first_byte.is_none() {
            *first_byte = Some(Instant::now());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_blank_line(&buf) {
            let head = buf[..pos].to_vec();
            let leftover = buf[pos + 4..].to_vec();
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProbeError::Probe("response head too large".to_string()));
        }
    }
}

fn webspeed_tls_config() -> Arc<rustls::ClientConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Run the speed test against `url_str`, dialing `target_ip` for the
/// original host.
pub(crate) async fn web_speed_test(
    url_str: &str,
    target_ip: IpAddr,
) -> Result<WebSpeedResult, ProbeError> {
    let parsed =
        Url::parse(url_str).map_err(|e| ProbeError::Probe(format!("parse URL error: {e}")))?;
    let origin_host = url_host(&parsed)?;
    let user_agent = pick_user_agent();

    // DNS window, measured once before the request chain.
    let dns_time = if origin_host.parse::<IpAddr>().is_err() {
        let dns_start = Instant::now();
        if let Err(e) = resolver::lookup_host(&origin_host).await {
            debug!("DNS lookup warning: {e}");
        }
        ms(dns_start.elapsed())
    } else {
        0.0
    };

    let total_start = Instant::now();
    let deadline = total_start + TOTAL_TIMEOUT;

    let mut current = parsed;
    let mut headers_text = String::new();
    let mut redirect_count = 0u32;
    let mut redirect_start: Option<Instant> = None;
    let mut connect_time = 0.0;
    let mut ssl_time = 0.0;
    let mut connect_end_at: Option<Instant> = None;
    let mut ssl_end_at: Option<Instant> = None;

    loop {
        let hop_host = url_host(&current)?;
        let hop_port = current.port_or_known_default().unwrap_or(80);
        let https = current.scheme() == "https";

        let addr = if hop_host == origin_host {
            target_ip
        } else if let Ok(ip) = hop_host.parse::<IpAddr>() {
            ip
        } else {
            *resolver::lookup_host(&hop_host)
                .await?
                .first()
                .ok_or_else(|| ProbeError::Probe(format!("no addresses for {hop_host}")))?
        };

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| ProbeError::Probe("request timed out".to_string()))?;
        let connect_budget = CONNECT_TIMEOUT.min(remaining);

        let connect_started = Instant::now();
        let tcp = tokio::time::timeout(
            connect_budget,
            TcpStream::connect(SocketAddr::new(addr, hop_port)),
        )
        .await
        .map_err(|_| ProbeError::Probe(format!("connect to {addr} timed out")))?
        .map_err(|e| ProbeError::Probe(format!("connect error: {e}")))?;
        let connect_ended = Instant::now();
        connect_time = ms(connect_ended.duration_since(connect_started));
        connect_end_at = Some(connect_ended);

        let mut stream: Box<dyn IoStream> = if https {
            let server_name = rustls_pki_types::ServerName::try_from(hop_host.clone())
                .map_err(|e| ProbeError::Probe(format!("invalid server name: {e}")))?;
            let connector = TlsConnector::from(webspeed_tls_config());
            let ssl_started = Instant::now();
            let tls = tokio::time::timeout(connect_budget, connector.connect(server_name, tcp))
                .await
                .map_err(|_| ProbeError::Probe("TLS handshake timed out".to_string()))?
                .map_err(|e| ProbeError::Probe(format!("TLS handshake error: {e}")))?;
            let ssl_ended = Instant::now();
            ssl_time = ms(ssl_ended.duration_since(ssl_started));
            ssl_end_at = Some(ssl_ended);
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept-Encoding: gzip, deflate, br\r\nConnection: close\r\n\r\n",
            path_and_query(&current),
            hop_host,
            user_agent,
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ProbeError::Probe(format!("request error: {e}")))?;

        let mut first_byte_at: Option<Instant> = None;
        let (head_bytes, leftover) = read_head(&mut stream, deadline, &mut first_byte_at).await?;
        let head = parse_head(&head_bytes)?;

        if (300..400).contains(&head.code) {
            if let Some(location) = head.header("location") {
                if redirect_count >= MAX_REDIRECTS {
                    return Err(ProbeError::Probe("too many redirects".to_string()));
                }
                redirect_count += 1;
                if redirect_start.is_none() {
                    redirect_start = Some(Instant::now());
                }
                headers_text.push_str(&head.raw_text());
                headers_text.push('\n');
                current = current
                    .join(location)
                    .map_err(|e| ProbeError::Probe(format!("bad redirect target: {e}")))?;
                continue;
            }
        }

        // Final response: capture headers and drain the body under both caps.
        headers_text.push_str(&head.raw_text());
        let content_length = head.header("content-length").and_then(|v| v.parse::<u64>().ok());

        let download_start_at = first_byte_at.unwrap_or_else(Instant::now);
        let download_deadline = Instant::now() + MAX_DOWNLOAD_TIME;
        let mut downloaded = leftover.len() as u64;
        if downloaded > MAX_DOWNLOAD_SIZE {
            downloaded = MAX_DOWNLOAD_SIZE;
        }

        let mut buf = [0u8; 8192];
        loop {
            if downloaded >= MAX_DOWNLOAD_SIZE {
                break;
            }
            if let Some(length) = content_length {
                if downloaded >= length {
                    break;
                }
            }
            let now = Instant::now();
            let stop_at = download_deadline.min(deadline);
            let Some(budget) = stop_at.checked_duration_since(now) else {
                break;
            };
            match tokio::time::timeout(budget, stream.read(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    debug!("Download warning: {e}");
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if downloaded + n as u64 > MAX_DOWNLOAD_SIZE {
                        downloaded = MAX_DOWNLOAD_SIZE;
                        break;
                    }
                    downloaded += n as u64;
                }
            }
        }

        let download_end = Instant::now();
        let total_time = ms(download_end.duration_since(total_start));
        let download_time = ms(download_end.duration_since(download_start_at));
        let wait_time = match first_byte_at {
            Some(first_byte) => {
                let reference = ssl_end_at.or(connect_end_at).unwrap_or(total_start);
                ms(first_byte.saturating_duration_since(reference))
            }
            None => 0.0,
        };
        let redirect_time = match redirect_start {
            Some(start) if redirect_count > 0 => {
                let end = first_byte_at.unwrap_or(download_end);
                ms(end.saturating_duration_since(start))
            }
            _ => 0.0,
        };

        let denominator = wait_time + download_time;
        let download_speed = if denominator > 0.0 {
            round_to(downloaded as f64 / (denominator / 1000.0), 2)
        } else {
            0.0
        };

        return Ok(WebSpeedResult {
            http_code: head.code,
            total_time: round_to(total_time, 3),
            dns_time: round_to(dns_time, 3),
            connect_time: round_to(connect_time, 3),
            ssl_time: round_to(ssl_time, 3),
            wait_time: round_to(wait_time, 3),
            download_time: round_to(download_time, 3),
            download_size: downloaded,
            download_speed,
            redirect_count,
            redirect_time: round_to(redirect_time, 3),
            http_headers: headers_text,
        });
    }
}
