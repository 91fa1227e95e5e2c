//! Ping probe
//!
//! ICMP echo (privileged socket) or single-shot TCP connect against a
//! resolved target. Once mode runs one iteration of three echoes;
//! continuous mode runs one hundred iterations of one echo each, with a
//! minimum one-second cadence and the stop signal observed between
//! iterations. Probe failures are reported as a zero delay, never as a
//! task failure.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::net::resolver;
use crate::probes::{Prepared, ProbeError, ProbeHandler, ResultSender};

/// Per-iteration probe budget.
const PING_TIMEOUT: Duration = Duration::from_millis(800);

/// Minimum spacing between result frames.
const ITERATION_CADENCE: Duration = Duration::from_secs(1);

const CONTINUOUS_ITERATIONS: u16 = 100;
const ONCE_ECHO_COUNT: u16 = 3;

#[derive(Debug, Deserialize)]
struct PingRequest {
    host: String,
    /// Required for shape validation; execute reads it from the
    /// enriched payload.
    #[serde(rename = "pingtype")]
    _pingtype: String,
    protocol: String,
    #[serde(rename = "taskId")]
    task_id: String,
}

/// Handler for `request-ping` tasks.
pub struct PingHandler {
    runtime: Arc<RuntimeConfig>,
}

impl PingHandler {
    pub fn new(runtime: Arc<RuntimeConfig>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ProbeHandler for PingHandler {
    fn task_type(&self) -> &'static str {
        "ping"
    }

    fn validate(&self, data: &Value) -> Result<(), ProbeError> {
        serde_json::from_value::<PingRequest>(data.clone())
            .map(|_| ())
            .map_err(|_| ProbeError::InvalidData)
    }

    async fn preprocess(&self, data: Value) -> Result<Prepared, ProbeError> {
        let request: PingRequest =
            serde_json::from_value(data.clone()).map_err(|_| ProbeError::InvalidData)?;

        let host = clean_target(&request.host);
        let target = resolver::filter_ip(&host, self.runtime.ip_prefer()).await?;

        // TCP keeps the resolved port; other protocols carry none.
        let port = if request.protocol == "tcp" {
            target.port.to_string()
        } else {
            String::new()
        };

        let ack = json!({
            "ip": target.ip.to_string(),
            "port": port,
            "ipVersion": target.version.label(),
            "taskType": self.task_type(),
            "taskId": request.task_id,
        });

        let mut enriched = data;
        if let Some(map) = enriched.as_object_mut() {
            map.insert("ip".to_string(), json!(target.ip.to_string()));
            map.insert("host".to_string(), json!(target.host));
            map.insert("port".to_string(), json!(port));
            map.insert("ipVersion".to_string(), json!(target.version.label()));
        }
        debug!("ping task prepared: {}", enriched);

        Ok(Prepared {
            data: enriched,
            ack,
        })
    }

    async fn execute(
        &self,
        data: &Value,
        task_id: &str,
        mut stop: watch::Receiver<bool>,
        sender: Arc<dyn ResultSender>,
    ) -> Result<(), ProbeError> {
        let ip: IpAddr = data
            .get("ip")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or(ProbeError::InvalidData)?;
        let protocol = data.get("protocol").and_then(|v| v.as_str()).unwrap_or("");
        let pingtype = data.get("pingtype").and_then(|v| v.as_str()).unwrap_or("");
        let port = data
            .get("port")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u16>().ok());

        let (echo_count, iterations) = if pingtype == "continuous" {
            (1, CONTINUOUS_ITERATIONS)
        } else {
            (ONCE_ECHO_COUNT, 1)
        };

        for _ in 0..iterations {
            if *stop.borrow() {
                info!("Task {} received stop signal...", task_id);
                return Ok(());
            }

            let start = Instant::now();
            let delay = match protocol {
                "icmp" => icmp_ping(ip, echo_count).await.unwrap_or_else(|e| {
                    debug!("ping error: {e}");
                    0.0
                }),
                "tcp" => tcp_ping(ip, port).await.unwrap_or_else(|e| {
                    debug!("ping error: {e}");
                    0.0
                }),
                _ => 0.0,
            };

            let result = json!({
                "delay": delay,
                "taskType": self.task_type(),
                "taskId": task_id,
            });
            sender.send("agent-response", &result).await;

            let elapsed = start.elapsed();
            if elapsed < ITERATION_CADENCE {
                tokio::select! {
                    _ = tokio::time::sleep(ITERATION_CADENCE - elapsed) => {}
                    _ = stop.changed() => {}
                }
            }
        }
        Ok(())
    }
}

/// Strip whitespace, quotes, and surrounding brackets from the target.
fn clean_target(host: &str) -> String {
    let trimmed = host.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        trimmed
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    } else {
        trimmed.to_string()
    }
}

/// Average RTT in milliseconds over up to `count` echoes within the
/// 800 ms probe budget. No replies at all is an error.
async fn icmp_ping(ip: IpAddr, count: u16) -> Result<f64, ProbeError> {
    let config = match ip {
        IpAddr::V4(_) => Config::default(),
        IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
    };
    let client = Client::new(&config).map_err(|e| ProbeError::Probe(e.to_string()))?;

    let mut ident = [0u8; 2];
    let _ = getrandom::fill(&mut ident);
    let mut pinger = client
        .pinger(ip, PingIdentifier(u16::from_be_bytes(ident)))
        .await;
    pinger.timeout(PING_TIMEOUT);

    let payload = [0u8; 56];
    let deadline = Instant::now() + PING_TIMEOUT;
    let mut received: Vec<Duration> = Vec::with_capacity(count as usize);

    for seq in 0..count {
        if Instant::now() >= deadline {
            break;
        }
        match pinger.ping(PingSequence(seq), &payload).await {
            Ok((_, rtt)) => received.push(rtt),
            Err(e) => debug!("icmp echo {seq} failed: {e}"),
        }
    }

    if received.is_empty() {
        return Err(ProbeError::Probe("no packets received".to_string()));
    }
    let total_us: u128 = received.iter().map(|d| d.as_micros()).sum();
    Ok(total_us as f64 / received.len() as f64 / 1000.0)
}

/// Elapsed connect time in milliseconds for a single TCP dial.
async fn tcp_ping(ip: IpAddr, port: Option<u16>) -> Result<f64, ProbeError> {
    let port = port.ok_or_else(|| ProbeError::Probe("missing port".to_string()))?;
    let start = Instant::now();
    let stream = tokio::time::timeout(PING_TIMEOUT, TcpStream::connect(SocketAddr::new(ip, port)))
        .await
        .map_err(|_| ProbeError::Probe("connect timed out".to_string()))?
        .map_err(|e| ProbeError::Probe(e.to_string()))?;
    drop(stream);
    Ok(start.elapsed().as_micros() as f64 / 1000.0)
}
