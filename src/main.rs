use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use adm_agent::cli::{self, Cli, Command, RegisterArgs};
use adm_agent::config::{
    self, AgentIdentity, MemorySettings, RuntimeConfig, SettingsStore, ShareEndpoint,
};
use adm_agent::control::ControlClient;
use adm_agent::logging;
use adm_agent::net::identity::ClientIdentity;
use adm_agent::net::resolver::IpFamily;
use adm_agent::probes::ping::PingHandler;
use adm_agent::probes::webspeed::WebspeedHandler;
use adm_agent::probes::ProbeRegistry;
use adm_agent::session::Session;
use adm_agent::update::UpdateClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // The file-backed settings collaborator is wired in by the service
    // build; this binary seeds defaults and environment overrides.
    let store = Arc::new(MemorySettings::with_defaults());
    config::apply_env_overrides(store.as_ref());

    init_logging_from_env(store.as_ref())?;

    match cli.command {
        None | Some(Command::Run) => run_agent(store).await,
        Some(Command::Register(args)) => register_agent(args, store).await,
        Some(Command::Update { check }) => handle_update(check, store).await,
    }
}

/// Pick the log profile from `ADM_DEV` or the configured environment.
fn init_logging_from_env(store: &MemorySettings) -> Result<(), Box<dyn std::error::Error>> {
    let dev_env = std::env::var("ADM_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
        || store.get("app.env").as_deref() == Some("dev");
    let log_config = if dev_env {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)
}

fn build_runtime(store: &MemorySettings) -> Arc<RuntimeConfig> {
    let app_env = store.get("app.env").unwrap_or_else(|| "prod".to_string());
    store.set("version", env!("CARGO_PKG_VERSION"));
    let runtime = Arc::new(RuntimeConfig::new(env!("CARGO_PKG_VERSION"), app_env));
    if let Some(prefer) = store
        .get("ip.prefer")
        .and_then(|v| IpFamily::from_prefer(&v))
    {
        runtime.set_ip_prefer(prefer);
    }
    runtime
}

/// Client certificate for share-mode connections, when provided.
fn share_client_identity() -> Option<ClientIdentity> {
    let cert = std::env::var("ADM_SHARE_CERT_FILE")
        .ok()
        .filter(|v| !v.is_empty())?;
    let key = std::env::var("ADM_SHARE_KEY_FILE")
        .ok()
        .filter(|v| !v.is_empty())?;
    match ClientIdentity::from_pem_files(&cert, &key) {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!("Failed to load share client identity: {e}");
            None
        }
    }
}

fn fatal(message: &str) -> ! {
    error!("{message}");
    std::process::exit(1);
}

/// Start one session per configured endpoint and run until shutdown.
async fn run_agent(store: Arc<MemorySettings>) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = build_runtime(store.as_ref());
    let updater = Arc::new(UpdateClient::new(&runtime));

    info!("Adm agent v{}", runtime.version);

    // Background update check at startup.
    {
        let updater = updater.clone();
        tokio::spawn(async move {
            if let Err(e) = updater.check().await {
                warn!("CheckUpdate error: {e}");
            }
        });
    }

    let registry = Arc::new(ProbeRegistry::new());
    registry.register(Arc::new(PingHandler::new(runtime.clone())));
    registry.register(Arc::new(WebspeedHandler::new(runtime.clone())));

    let mut handles = Vec::new();

    let primary = config::primary_identity(store.as_ref());
    if !primary.api_url.is_empty() && !primary.auth_code.is_empty() {
        let mut session = Session::new(
            Arc::new(primary),
            runtime.clone(),
            registry.clone(),
            None,
            updater.clone(),
        )?;
        handles.push(tokio::spawn(async move {
            if let Err(e) = session.run().await {
                error!("SocketConnect failed: {e}");
            }
        }));
    }

    let endpoint = ShareEndpoint::resolve(&runtime);
    let mut share = config::share_identity(store.as_ref());
    if share.share_enable && !endpoint.url.is_empty() {
        share.api_url = endpoint.url;
        share.api_key = endpoint.key;
        share.api_secret = endpoint.secret;
        info!("Share server enable");

        if !share.auth_code.is_empty() {
            let mut session = Session::new(
                Arc::new(share),
                runtime.clone(),
                registry.clone(),
                share_client_identity(),
                updater.clone(),
            )?;
            handles.push(tokio::spawn(async move {
                if let Err(e) = session.run().await {
                    error!("SocketConnect share server failed: {e}");
                }
            }));
        }
    }

    if handles.is_empty() {
        fatal("No valid configuration.");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = futures_util::future::join_all(handles) => {}
    }
    Ok(())
}

/// Register the configured profiles and persist their auth codes.
async fn register_agent(
    args: RegisterArgs,
    store: Arc<MemorySettings>,
) -> Result<(), Box<dyn std::error::Error>> {
    let api_url = match &args.api {
        Some(url) => {
            if let Err(e) = cli::validate_api_url(url) {
                fatal(&e);
            }
            url.clone()
        }
        None => store.get("api.url").unwrap_or_default(),
    };
    if let Some(key) = &args.key {
        if let Err(e) = cli::validate_key(key) {
            fatal(&e);
        }
    }
    if let Some(secret) = &args.secret {
        if let Err(e) = cli::validate_secret(secret) {
            fatal(&e);
        }
    }
    let share_enable = match &args.share {
        Some(share) => match cli::validate_share(share) {
            Ok(normalized) => normalized,
            Err(e) => fatal(&e),
        },
        None => store
            .get("share.enable")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "no".to_string()),
    };
    let share_name = match (&share_enable[..], &args.share_name) {
        ("yes", Some(name)) => {
            if let Err(e) = cli::validate_share_name(name) {
                fatal(&e);
            }
            name.clone()
        }
        _ => store.get("share.name").unwrap_or_default(),
    };
    if api_url.is_empty() && share_enable == "no" {
        fatal("Please specify your server address");
    }

    let runtime = build_runtime(store.as_ref());
    let mut registered = false;

    let primary = AgentIdentity {
        api_url: api_url.clone(),
        api_key: args.key.clone().unwrap_or_default(),
        api_secret: args.secret.clone().unwrap_or_default(),
        auth_code: store.get("api.authcode").unwrap_or_default(),
        ..Default::default()
    };
    if !primary.api_url.is_empty() && !primary.api_key.is_empty() && !primary.api_secret.is_empty()
    {
        let client = ControlClient::new(
            primary.api_url.clone(),
            primary.api_secret.clone(),
            runtime.version.clone(),
            None,
        );
        match client
            .register_node(&primary, &runtime, store.as_ref())
            .await
        {
            Ok(node) => {
                store.set("api.url", &primary.api_url);
                store.set("api.authcode", &node.auth_code);
                store.set("api.did", &node.did);
                store.persist()?;
                registered = true;
            }
            Err(e) => fatal(&format!("Get authCode failed: {e}")),
        }
    }

    info!("Share enable: {share_enable}");
    let endpoint = ShareEndpoint::resolve(&runtime);
    if share_enable == "yes" && !endpoint.url.is_empty() {
        if !endpoint.key.is_empty() && !endpoint.secret.is_empty() {
            let share = AgentIdentity {
                api_url: endpoint.url.clone(),
                api_key: endpoint.key.clone(),
                api_secret: endpoint.secret.clone(),
                auth_code: store.get("share.authcode").unwrap_or_default(),
                share_enable: true,
                share_name: share_name.clone(),
                share_sponsor_id: args
                    .sponsor_id
                    .clone()
                    .or_else(|| store.get("share.sponsorid"))
                    .unwrap_or_default(),
                ..Default::default()
            };
            let client = ControlClient::new(
                share.api_url.clone(),
                share.api_secret.clone(),
                runtime.version.clone(),
                share_client_identity(),
            );
            match client.register_node(&share, &runtime, store.as_ref()).await {
                Ok(node) => {
                    store.set("share.enable", "yes");
                    store.set("share.name", &share.share_name);
                    store.set("share.authcode", &node.auth_code);
                    store.set("share.did", &node.did);
                    store.persist()?;
                    registered = true;
                }
                Err(e) => fatal(&format!("Get share authCode failed: {e}")),
            }
        }
    }

    if registered {
        info!("Successful registration.");
        Ok(())
    } else {
        fatal("Invalid registration data.");
    }
}

/// `update` subcommand: report or install the latest release.
async fn handle_update(
    check: bool,
    store: Arc<MemorySettings>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = build_runtime(store.as_ref());
    let updater = UpdateClient::new(&runtime);

    if check {
        match updater.check().await {
            Ok(Some(release)) => {
                println!(
                    "Update available: v{} -> v{}",
                    runtime.version, release.version
                );
            }
            Ok(None) => println!("Already up to date (v{})", runtime.version),
            Err(e) => fatal(&format!("CheckUpdate error: {e}")),
        }
        return Ok(());
    }

    // A successful apply replaces the binary and exits.
    if let Err(e) = updater.apply().await {
        fatal(&format!("DoUpdate error: {e}"));
    }
    Ok(())
}
