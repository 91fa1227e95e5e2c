//! Control-plane client
//!
//! Node registration and agent token requests. Both endpoints share one
//! error taxonomy; the server's code 20015 ("node blocked") is promoted
//! to [`ControlError::Blocked`] so the session can terminate for good.

pub mod sign;

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::Method;
use thiserror::Error;
use tracing::debug;

use crate::config::{AgentIdentity, RuntimeConfig, SettingsStore};
use crate::fingerprint;
use crate::net::http::{Http, HttpError, RequestData};
use crate::net::identity::ClientIdentity;
use crate::net::resolver::{self, IpFamily};

const REGIST_PATH: &str = "/api/adm/v1/registNode";
const TOKEN_PATH: &str = "/api/adm/v1/requestAgentToken";

/// Server response code meaning the node is blocked.
pub const CODE_BLOCKED: i64 = 20015;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("this node is blocked by the server")]
    Blocked,

    #[error("unable to obtain the IP address of this server")]
    NoPublicAddress,

    #[error("registNode response data is of unexpected type")]
    BadRegistResponse,

    #[error("requestAgentToken response data is of unexpected type")]
    BadTokenResponse,

    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Registration result, persisted to the settings store by the caller.
#[derive(Debug)]
pub struct NodeInfo {
    pub auth_code: String,
    pub did: String,
    pub cookies: Arc<Jar>,
}

/// Session token plus the cookies that must accompany the socket dial.
#[derive(Debug)]
pub struct TokenInfo {
    pub token: String,
    pub cookies: Arc<Jar>,
}

/// Client for one control-plane endpoint.
#[derive(Debug, Clone)]
pub struct ControlClient {
    pub api_url: String,
    pub secret: String,
    pub version: String,
    pub identity: Option<ClientIdentity>,
}

impl ControlClient {
    pub fn new(
        api_url: impl Into<String>,
        secret: impl Into<String>,
        version: impl Into<String>,
        identity: Option<ClientIdentity>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            secret: secret.into(),
            version: version.into(),
            identity,
        }
    }

    pub fn user_agent(&self) -> String {
        format!("Adm-agent/{}", self.version)
    }

    /// Signed request parameter appended to share-mode URLs.
    pub fn req_sign_query(&self, path: &str) -> String {
        if self.identity.is_some() {
            format!("&reqsign={}", sign::req_sign(path, &self.secret))
        } else {
            String::new()
        }
    }

    /// Register this node and return its `{auth_code, did}`.
    pub async fn register_node(
        &self,
        agent: &AgentIdentity,
        runtime: &RuntimeConfig,
        store: &dyn SettingsStore,
    ) -> Result<NodeInfo, ControlError> {
        let envelope = self.make_regist_params(agent, runtime, store).await?;

        debug!("Register a node on {}", self.api_url);
        let url = format!(
            "{}{}?signature={}{}",
            self.api_url,
            REGIST_PATH,
            envelope.signature,
            self.req_sign_query(REGIST_PATH)
        );
        let http = Http {
            data: Some(RequestData::Raw(envelope.body)),
            identity: self.identity.clone(),
            ..Http::new(url, Method::POST, self.user_agent())
        };
        let response = http.api_request().await.map_err(Self::map_blocked)?;

        let data = match response.envelope.data {
            Some(serde_json::Value::Object(map)) => map,
            _ => return Err(ControlError::BadRegistResponse),
        };
        Ok(NodeInfo {
            auth_code: data
                .get("auth_code")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            did: data
                .get("did")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            cookies: response.cookies,
        })
    }

    /// Fetch a session token for the socket dial.
    pub async fn request_agent_token(&self, auth_code: &str) -> Result<TokenInfo, ControlError> {
        let url = format!(
            "{}{}?auth_code={}{}",
            self.api_url,
            TOKEN_PATH,
            auth_code,
            self.req_sign_query(TOKEN_PATH)
        );
        let http = Http {
            identity: self.identity.clone(),
            ..Http::new(url, Method::POST, self.user_agent())
        };
        let response = http.api_request().await.map_err(Self::map_blocked)?;

        let token = match response.envelope.data {
            Some(serde_json::Value::Object(map)) => map
                .get("token")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or(ControlError::BadTokenResponse)?,
            _ => return Err(ControlError::BadTokenResponse),
        };
        Ok(TokenInfo {
            token,
            cookies: response.cookies,
        })
    }

    fn map_blocked(err: HttpError) -> ControlError {
        match err {
            HttpError::Api {
                code: CODE_BLOCKED, ..
            } => ControlError::Blocked,
            other => ControlError::Http(other),
        }
    }

    /// Build the signed registration envelope: sorted parameters, the
    /// canonical message, and its HMAC-SHA256 signature.
    async fn make_regist_params(
        &self,
        agent: &AgentIdentity,
        runtime: &RuntimeConfig,
        store: &dyn SettingsStore,
    ) -> Result<RegistEnvelope, ControlError> {
        let mut params = BTreeMap::new();
        params.insert("key".to_string(), agent.api_key.clone());
        params.insert("fingerprint".to_string(), fingerprint::generate());
        params.insert(
            "timestamp".to_string(),
            sign::unix_timestamp().to_string(),
        );
        params.insert("nonce".to_string(), sign::nonce());

        if !agent.auth_code.is_empty() {
            params.insert("auth_code".to_string(), agent.auth_code.clone());
        }
        if !agent.share_name.is_empty() {
            params.insert("sponsor".to_string(), agent.share_name.clone());
        }
        if !agent.share_sponsor_id.is_empty() {
            params.insert("sponsor_id".to_string(), agent.share_sponsor_id.clone());
        }

        let ua = self.user_agent();
        let ipv4 = resolver::public_ip(Some(IpFamily::V4), &ua).await.ok();
        let ipv6 = resolver::public_ip(Some(IpFamily::V6), &ua).await.ok();

        if ipv4.is_none() && ipv6.is_some() {
            runtime.set_ip_prefer(IpFamily::V6);
            store.set("ip.prefer", "ipv6");
        }
        if ipv4.is_none() && ipv6.is_none() {
            return Err(ControlError::NoPublicAddress);
        }
        if let Some(ip) = ipv4 {
            params.insert("ipv4".to_string(), ip);
        }
        if let Some(ip) = ipv6 {
            params.insert("ipv6".to_string(), ip);
        }

        params.insert("version".to_string(), runtime.version.clone());
        debug!("Regist params: {:?}", params);

        let message = sign::canonical_message(&params);
        Ok(RegistEnvelope {
            body: sign::encode_form(&params),
            signature: sign::hmac_sha256_hex(&self.secret, &message),
        })
    }
}

struct RegistEnvelope {
    body: String,
    signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_sign_present_iff_identity() {
        let plain = ControlClient::new("https://api.example.com", "secret", "1.0.0", None);
        assert!(plain.req_sign_query(TOKEN_PATH).is_empty());

        let mtls = ControlClient::new(
            "https://api.example.com",
            "secret",
            "1.0.0",
            Some(ClientIdentity::from_pem(b"cert".to_vec(), b"key".to_vec())),
        );
        let query = mtls.req_sign_query(TOKEN_PATH);
        assert!(query.starts_with("&reqsign="));
    }

    #[test]
    fn test_blocked_code_is_promoted() {
        let err = ControlClient::map_blocked(HttpError::Api {
            code: CODE_BLOCKED,
            message: "node blocked".to_string(),
        });
        assert!(matches!(err, ControlError::Blocked));

        let err = ControlClient::map_blocked(HttpError::Api {
            code: 500,
            message: "server error".to_string(),
        });
        assert!(matches!(err, ControlError::Http(_)));
    }

    #[test]
    fn test_user_agent_carries_version() {
        let client = ControlClient::new("https://api.example.com", "s", "1.2.0", None);
        assert_eq!(client.user_agent(), "Adm-agent/1.2.0");
    }
}
