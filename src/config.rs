//! Agent configuration
//!
//! The process-wide identity record, the shared runtime record, and the
//! persistence contract. Reading and writing the configuration file on
//! disk is the supervisor's concern; this module only defines the store
//! interface the registration client persists through, plus an in-memory
//! implementation used at startup and in tests.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::net::resolver::IpFamily;

/// Configuration errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to persist settings: {0}")]
    Persist(String),
}

/// Identity of one control-plane profile.
///
/// Created once at startup; the registration client writes `auth_code`
/// and `did` back before any session starts, after which the record is
/// shared immutably for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub auth_code: String,
    pub did: String,
    pub share_enable: bool,
    pub share_name: String,
    pub share_sponsor_id: String,
}

/// Process-wide runtime record.
///
/// `ip_prefer` is the only mutable field: the public-IP probe caches an
/// IPv6 preference when IPv4 turns out to be unreachable.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub version: String,
    pub app_env: String,
    ip_prefer: RwLock<Option<IpFamily>>,
}

impl RuntimeConfig {
    pub fn new(version: impl Into<String>, app_env: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            app_env: app_env.into(),
            ip_prefer: RwLock::new(None),
        }
    }

    pub fn is_dev(&self) -> bool {
        self.app_env == "dev"
    }

    pub fn ip_prefer(&self) -> Option<IpFamily> {
        *self.ip_prefer.read()
    }

    pub fn set_ip_prefer(&self, family: IpFamily) {
        *self.ip_prefer.write() = Some(family);
    }
}

/// Persistence contract for agent settings.
///
/// Keys follow the flat dotted form the supervisor's config file uses:
/// `api.url`, `api.authcode`, `api.did`, `share.enable`, `share.name`,
/// `share.sponsorid`, `share.authcode`, `share.did`, `app.env`,
/// `ip.prefer`, `version`.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn persist(&self) -> Result<(), SettingsError>;
}

/// In-memory settings store.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with the default key set.
    pub fn with_defaults() -> Self {
        let store = Self::new();
        let environment =
            std::env::var("ADM_ENVIRONMENT").unwrap_or_else(|_| "prod".to_string());
        for (key, value) in [
            ("api.url", ""),
            ("api.authcode", ""),
            ("api.did", ""),
            ("share.enable", "no"),
            ("share.name", ""),
            ("share.sponsorid", ""),
            ("share.authcode", ""),
            ("share.did", ""),
            ("app.env", environment.as_str()),
            ("ip.prefer", ""),
        ] {
            store.set(key, value);
        }
        store
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }

    fn persist(&self) -> Result<(), SettingsError> {
        Ok(())
    }
}

/// Share endpoint parameters. In the dev environment these may be
/// overridden from `ADM_SHARE_URL` / `ADM_SHARE_KEY` / `ADM_SHARE_SECRET`.
#[derive(Debug, Clone, Default)]
pub struct ShareEndpoint {
    pub url: String,
    pub key: String,
    pub secret: String,
}

impl ShareEndpoint {
    pub fn resolve(runtime: &RuntimeConfig) -> Self {
        let mut endpoint = Self::default();
        if !runtime.is_dev() {
            return endpoint;
        }
        if let Ok(url) = std::env::var("ADM_SHARE_URL") {
            if !url.is_empty() {
                endpoint.url = url;
            }
        }
        if let Ok(key) = std::env::var("ADM_SHARE_KEY") {
            if !key.is_empty() {
                endpoint.key = key;
            }
        }
        if let Ok(secret) = std::env::var("ADM_SHARE_SECRET") {
            if !secret.is_empty() {
                endpoint.secret = secret;
            }
        }
        endpoint
    }
}

/// Overlay settings from the environment. The supervisor's file-backed
/// store normally populates these keys; environment variables cover
/// containerized deployments without a config file.
pub fn apply_env_overrides(store: &dyn SettingsStore) {
    for (key, var) in [
        ("api.url", "ADM_API_URL"),
        ("api.authcode", "ADM_API_AUTHCODE"),
        ("api.did", "ADM_API_DID"),
        ("share.enable", "ADM_SHARE_ENABLE"),
        ("share.name", "ADM_SHARE_NAME"),
        ("share.sponsorid", "ADM_SHARE_SPONSORID"),
        ("share.authcode", "ADM_SHARE_AUTHCODE"),
        ("share.did", "ADM_SHARE_DID"),
        ("ip.prefer", "ADM_IP_PREFER"),
    ] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                store.set(key, &value);
            }
        }
    }
}

/// Assemble the primary profile from the store.
pub fn primary_identity(store: &dyn SettingsStore) -> AgentIdentity {
    AgentIdentity {
        api_url: store.get("api.url").unwrap_or_default(),
        auth_code: store.get("api.authcode").unwrap_or_default(),
        did: store.get("api.did").unwrap_or_default(),
        ..Default::default()
    }
}

/// Assemble the share profile from the store.
pub fn share_identity(store: &dyn SettingsStore) -> AgentIdentity {
    AgentIdentity {
        share_enable: store
            .get("share.enable")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false),
        share_name: store.get("share.name").unwrap_or_default(),
        share_sponsor_id: store.get("share.sponsorid").unwrap_or_default(),
        auth_code: store.get("share.authcode").unwrap_or_default(),
        did: store.get("share.did").unwrap_or_default(),
        ..Default::default()
    }
}
