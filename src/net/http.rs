//! Control-plane HTTP wrapper
//!
//! One request, one client: each call builds a reqwest client with the
//! agent's dial policy (v4-first address pinning, 10 s connect, 60 s
//! keep-alive, 90 s idle), an optional client certificate, and a fresh
//! cookie jar that is handed back with the response so the session dial
//! can reuse the control plane's cookies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::net::identity::ClientIdentity;
use crate::net::resolver::{self, IpFamily};

/// Default whole-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE: Duration = Duration::from_secs(60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("failed to build HTTP client: {0}")]
    Build(String),

    #[error("{0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("[{code}] {message}")]
    Api { code: i64, message: String },
}

/// Structured control-plane response envelope.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A parsed envelope plus the cookies the server set.
#[derive(Debug)]
pub struct ApiResponse {
    pub envelope: ApiEnvelope,
    pub cookies: Arc<Jar>,
}

/// Request body / query payload.
#[derive(Debug, Clone)]
pub enum RequestData {
    /// Key-value pairs: query string for GET, form body otherwise.
    Form(Vec<(String, String)>),
    /// Pre-encoded `application/x-www-form-urlencoded` body.
    Raw(String),
    /// JSON body.
    Json(Value),
}

/// A single outbound HTTP request.
#[derive(Debug)]
pub struct Http {
    pub url: String,
    pub method: Method,
    pub data: Option<RequestData>,
    pub timeout: Duration,
    pub family: Option<IpFamily>,
    pub identity: Option<ClientIdentity>,
    pub user_agent: String,
}

impl Http {
    pub fn new(url: impl Into<String>, method: Method, user_agent: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            data: None,
            timeout: DEFAULT_TIMEOUT,
            family: None,
            identity: None,
            user_agent: user_agent.into(),
        }
    }

    /// Issue the request and parse the structured envelope. A body whose
    /// `code` is not 200 becomes `HttpError::Api` carrying that code.
    pub async fn api_request(&self) -> Result<ApiResponse, HttpError> {
        let (response, jar) = self.dispatch().await?;
        let body = response
            .text()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))?;
        debug!("Response body: {}", body);

        let envelope: ApiEnvelope =
            serde_json::from_str(&body).map_err(|e| HttpError::Decode(e.to_string()))?;
        if envelope.code != 200 {
            return Err(HttpError::Api {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(ApiResponse {
            envelope,
            cookies: jar,
        })
    }

    /// Issue the request and return the raw response body.
    pub async fn url_request(&self) -> Result<String, HttpError> {
        let (response, _jar) = self.dispatch().await?;
        let body = response
            .text()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))?;
        debug!("Response body: {}", body);
        Ok(body)
    }

    async fn dispatch(&self) -> Result<(reqwest::Response, Arc<Jar>), HttpError> {
        let (client, jar) = self.build_client().await?;

        let mut request = client.request(self.method.clone(), &self.url);
        request = request.header("accept-language", "en");

        if let Some(data) = &self.data {
            if self.method == Method::GET {
                if let RequestData::Form(pairs) = data {
                    request = request.query(pairs);
                }
            } else if self.method == Method::POST
                || self.method == Method::PUT
                || self.method == Method::PATCH
            {
                request = match data {
                    RequestData::Form(pairs) => request.form(pairs),
                    RequestData::Raw(body) => request
                        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                        .body(body.clone()),
                    RequestData::Json(value) => request.json(value),
                };
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| HttpError::Transport(shorten_error(&e.to_string())))?;
        Ok((response, jar))
    }

    async fn build_client(&self) -> Result<(Client, Arc<Jar>), HttpError> {
        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .use_rustls_tls()
            .cookie_provider(jar.clone())
            .timeout(self.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(KEEPALIVE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .user_agent(&self.user_agent);

        if let Some(identity) = &self.identity {
            let identity = identity
                .reqwest_identity()
                .map_err(|e| HttpError::Build(e.to_string()))?;
            builder = builder.identity(identity);
        }

        if let Some((host, addrs)) = self.pinned_addresses().await? {
            builder = builder.resolve_to_addrs(&host, &addrs);
        }

        let client = builder
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))?;
        Ok((client, jar))
    }

    /// Resolve the request host ahead of time so the connector dials a
    /// v4-first (or family-restricted) address list. IP-literal hosts
    /// need no pinning.
    async fn pinned_addresses(&self) -> Result<Option<(String, Vec<SocketAddr>)>, HttpError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| HttpError::Build(format!("invalid url {}: {e}", self.url)))?;
        let host = match url.host() {
            Some(url::Host::Domain(d)) => d.to_string(),
            _ => return Ok(None),
        };

        let mut ips = resolver::lookup_host(&host)
            .await
            .map_err(|e| HttpError::Transport(shorten_error(&e.to_string())))?;

        if let Some(family) = self.family {
            ips.retain(|ip| IpFamily::of(ip) == family);
            if ips.is_empty() {
                return Err(HttpError::Transport(format!(
                    "no {} addresses for {host}",
                    family.prefer_key()
                )));
            }
        } else {
            ips.sort_by_key(|ip| match IpFamily::of(ip) {
                IpFamily::V4 => 0u8,
                IpFamily::V6 => 1u8,
            });
        }

        let addrs = ips.into_iter().map(|ip| SocketAddr::new(ip, 0)).collect();
        Ok(Some((host, addrs)))
    }
}

/// Keep only the text after the last colon. Transport errors nest the
/// whole connector chain; the tail is the part worth surfacing.
pub fn shorten_error(message: &str) -> String {
    match message.rfind(':') {
        Some(idx) => message[idx + 1..].trim().to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten_error_takes_last_segment() {
        assert_eq!(
            shorten_error("error sending request: connect failed: connection refused"),
            "connection refused"
        );
        assert_eq!(shorten_error("plain message"), "plain message");
    }

    #[test]
    fn test_envelope_parses_partial_bodies() {
        let envelope: ApiEnvelope =
            serde_json::from_str(r#"{"code":200,"data":{"token":"t"}}"#).unwrap();
        assert_eq!(envelope.code, 200);
        assert!(!envelope.success);
        assert!(envelope.message.is_empty());
        assert!(envelope.data.is_some());

        let envelope: ApiEnvelope =
            serde_json::from_str(r#"{"success":false,"message":"node blocked","code":20015}"#)
                .unwrap();
        assert_eq!(envelope.code, 20015);
        assert_eq!(envelope.message, "node blocked");
    }

    #[tokio::test]
    async fn test_api_request_rejects_non_200_code() {
        // Serve a fixed envelope from a local listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let _ = stream.read(&mut buf).await;
            let body = r#"{"success":false,"message":"node blocked","code":20015}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });

        let http = Http::new(
            format!("http://{addr}/api"),
            Method::POST,
            "Adm-agent/0.0.0",
        );
        let err = http.api_request().await.unwrap_err();
        match err {
            HttpError::Api { code, message } => {
                assert_eq!(code, 20015);
                assert_eq!(message, "node blocked");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
