//! Self-update facade
//!
//! Opaque check/apply operations against a GitHub-releases-shaped
//! endpoint. The release URL is only taken from `ADM_RELEASE_URL` in the
//! dev environment, matching how the rest of the share configuration is
//! injected. A successful apply replaces the running binary and exits so
//! the supervisor respawns the new version.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::config::RuntimeConfig;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("release url is not configured")]
    NoReleaseUrl,

    #[error("update check failed: {0}")]
    Check(String),

    #[error("no matching binary asset found for platform '{0}'")]
    NoAsset(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("install failed: {0}")]
    Install(String),
}

/// An available newer release.
#[derive(Debug, Clone)]
pub struct ReleaseInfo {
    pub version: String,
    pub asset_name: String,
    pub download_url: String,
}

/// Update check/apply client.
#[derive(Debug)]
pub struct UpdateClient {
    release_url: Option<String>,
    version: String,
}

impl UpdateClient {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        let release_url = if runtime.is_dev() {
            std::env::var("ADM_RELEASE_URL")
                .ok()
                .filter(|v| !v.is_empty())
        } else {
            None
        };
        Self {
            release_url,
            version: runtime.version.clone(),
        }
    }

    /// Client pinned to an explicit release endpoint.
    pub fn with_release_url(release_url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            release_url: Some(release_url.into()),
            version: version.into(),
        }
    }

    fn user_agent(&self) -> String {
        format!("Adm-agent/{}", self.version)
    }

    /// Look up the latest release. `Ok(None)` means this build is
    /// current.
    pub async fn check(&self) -> Result<Option<ReleaseInfo>, UpdateError> {
        let base = self.release_url.as_ref().ok_or(UpdateError::NoReleaseUrl)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(self.user_agent())
            .build()
            .map_err(|e| UpdateError::Check(e.to_string()))?;

        let release: Value = client
            .get(format!("{}/latest", base.trim_end_matches('/')))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| UpdateError::Check(e.to_string()))?
            .error_for_status()
            .map_err(|e| UpdateError::Check(e.to_string()))?
            .json()
            .await
            .map_err(|e| UpdateError::Check(e.to_string()))?;

        let tag = release
            .get("tag_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpdateError::Check("release has no tag_name".to_string()))?;
        let latest = tag.strip_prefix('v').unwrap_or(tag);

        if !version_newer(latest, &self.version) {
            info!("Current version ({}) is the latest", self.version);
            return Ok(None);
        }
        info!("New version {} is available", latest);

        let platform = format!(
            "adm-agent-{}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        let asset = release
            .get("assets")
            .and_then(|v| v.as_array())
            .and_then(|assets| {
                assets.iter().find(|a| {
                    a.get("name")
                        .and_then(|n| n.as_str())
                        .is_some_and(|n| n.contains(&platform))
                })
            })
            .ok_or_else(|| UpdateError::NoAsset(platform.clone()))?;

        let download_url = asset
            .get("browser_download_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpdateError::Check("asset has no download URL".to_string()))?;
        let asset_name = asset
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&platform);

        Ok(Some(ReleaseInfo {
            version: latest.to_string(),
            asset_name: asset_name.to_string(),
            download_url: download_url.to_string(),
        }))
    }

    /// Check, and when an update exists, install it over the running
    /// binary. Exits the process after a successful swap.
    pub async fn apply(&self) -> Result<(), UpdateError> {
        let Some(release) = self.check().await? else {
            return Ok(());
        };

        let client = reqwest::Client::builder()
            .user_agent(self.user_agent())
            .build()
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        let bytes = client
            .get(&release.download_url)
            .send()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?
            .error_for_status()
            .map_err(|e| UpdateError::Download(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        if bytes.is_empty() {
            return Err(UpdateError::Download("downloaded asset is empty".to_string()));
        }

        let exe = std::env::current_exe()
            .map_err(|_| UpdateError::Install("could not locate executable path".to_string()))?;
        let staged = exe.with_extension("new");
        std::fs::write(&staged, &bytes).map_err(|e| UpdateError::Install(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| UpdateError::Install(e.to_string()))?;
        }

        std::fs::rename(&staged, &exe).map_err(|e| UpdateError::Install(e.to_string()))?;
        info!("Successfully updated to version {}", release.version);

        // Let the supervisor respawn the fresh binary.
        std::process::exit(1);
    }
}

/// Numeric dotted-version comparison; non-numeric segments compare as 0.
fn version_newer(candidate: &str, current: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|seg| {
                seg.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let candidate = parse(candidate);
    let current = parse(current);
    let len = candidate.len().max(current.len());
    for i in 0..len {
        let a = candidate.get(i).copied().unwrap_or(0);
        let b = current.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_version_newer() {
        assert!(version_newer("1.2.1", "1.2.0"));
        assert!(version_newer("2.0.0", "1.9.9"));
        assert!(version_newer("1.2.0.1", "1.2.0"));
        assert!(!version_newer("1.2.0", "1.2.0"));
        assert!(!version_newer("1.1.9", "1.2.0"));
    }

    #[test]
    fn test_check_without_release_url() {
        let runtime = RuntimeConfig::new("1.0.0", "prod");
        let client = UpdateClient::new(&runtime);
        let err = futures_util::FutureExt::now_or_never(client.check())
            .expect("resolves immediately")
            .unwrap_err();
        assert!(matches!(err, UpdateError::NoReleaseUrl));
    }

    #[tokio::test]
    async fn test_check_reports_newer_release() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let body = format!(
                r#"{{"tag_name":"v99.0.0","assets":[{{"name":"adm-agent-{}-{}","browser_download_url":"http://invalid.invalid/asset"}}]}}"#,
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });

        let client = UpdateClient::with_release_url(format!("http://{addr}"), "1.0.0");
        let release = client.check().await.unwrap().expect("update available");
        assert_eq!(release.version, "99.0.0");
        assert!(release.asset_name.starts_with("adm-agent-"));
    }

    #[tokio::test]
    async fn test_check_up_to_date_is_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let body = r#"{"tag_name":"v1.0.0","assets":[]}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });

        let client = UpdateClient::with_release_url(format!("http://{addr}"), "1.0.0");
        assert!(client.check().await.unwrap().is_none());
    }
}
