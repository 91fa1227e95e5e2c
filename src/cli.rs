//! Command-line interface
//!
//! `run` (the default) starts the agent, `register` obtains an
//! authorization code, `update` checks for or installs a new binary.
//! Shape validation of registration inputs happens here so bad
//! credentials fail before any network traffic.

use std::sync::LazyLock;

use clap::{Args, Parser, Subcommand};
use regex::Regex;

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{8}$").expect("key regex"));
static SECRET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{16}$").expect("secret regex"));
static SHARE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\p{Han}a-zA-Z][\p{Han}a-zA-Z0-9_-]{1,19}$").expect("share name regex")
});

#[derive(Debug, Parser)]
#[command(name = "adm-agent", about = "Adm agent", version)]
pub struct Cli {
    /// Set configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent
    Run,
    /// Register a node to get an authorization code
    Register(RegisterArgs),
    /// Check for updates or install the latest release
    Update {
        /// Only report whether an update exists
        #[arg(long)]
        check: bool,
    },
}

#[derive(Debug, Args, Default)]
pub struct RegisterArgs {
    /// Server api url
    #[arg(short = 'a', long = "api")]
    pub api: Option<String>,

    /// Api key
    #[arg(short = 'k', long)]
    pub key: Option<String>,

    /// Api secret
    #[arg(short = 's', long)]
    pub secret: Option<String>,

    /// Share node (yes|no)
    #[arg(long)]
    pub share: Option<String>,

    /// Your share name
    #[arg(long = "sharename")]
    pub share_name: Option<String>,

    /// Your share id
    #[arg(long = "sponsorid")]
    pub sponsor_id: Option<String>,
}

/// Check an API base URL: absolute http(s) only.
pub fn validate_api_url(url: &str) -> Result<(), String> {
    let ok = (url.starts_with("http://") || url.starts_with("https://"))
        && url::Url::parse(url).is_ok();
    if ok {
        Ok(())
    } else {
        Err("The API address is invalid".to_string())
    }
}

pub fn validate_key(key: &str) -> Result<(), String> {
    if KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err("Key must be 8 alphanumeric characters".to_string())
    }
}

pub fn validate_secret(secret: &str) -> Result<(), String> {
    if SECRET_RE.is_match(secret) {
        Ok(())
    } else {
        Err("Secret must be 16 alphanumeric characters".to_string())
    }
}

/// Normalize the share toggle to lowercase `yes`/`no`.
pub fn validate_share(share: &str) -> Result<String, String> {
    if share.eq_ignore_ascii_case("yes") || share.eq_ignore_ascii_case("no") {
        Ok(share.to_lowercase())
    } else {
        Err("Share must be yes or no".to_string())
    }
}

pub fn validate_share_name(name: &str) -> Result<(), String> {
    if SHARE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(concat!(
            "Share name must be 2 to 20 characters, start with a letter, ",
            "and can only contain letters, numbers, underscores, and hyphens"
        )
        .to_string())
    }
}
