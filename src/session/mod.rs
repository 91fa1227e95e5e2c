//! Session runtime
//!
//! One session owns one authenticated WebSocket to the control plane and
//! everything scoped to it: the reader loop, the writer task draining a
//! bounded outbound queue, the heartbeat watchdog, and the per-task stop
//! signals. `run` reconnects with exponential backoff until the control
//! plane blocks the node.

pub mod events;
pub mod frame;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{AgentIdentity, RuntimeConfig};
use crate::control::{ControlClient, ControlError, TokenInfo};
use crate::net::dialer::DualStackDialer;
use crate::net::identity::ClientIdentity;
use crate::probes::{ProbeRegistry, ResultSender};
use crate::session::events::InboundEvent;
use crate::session::frame::Frame;
use crate::update::UpdateClient;

/// Outbound queue depth.
pub const OUTBOUND_QUEUE_SIZE: usize = 100;

/// How long a producer may wait for queue space before dropping.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Heartbeat silence that counts as a dead connection.
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(20);

/// Upper bound on concurrently tracked tasks.
pub const MAX_TRACKED_TASKS: usize = 1024;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to parse URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("auth code is required to start a session")]
    MissingAuthCode,

    #[error("GetToken failed: {0}")]
    Token(ControlError),

    #[error("Connect to socket server {host} failed: {message}")]
    Dial { host: String, message: String },

    #[error("Connect to socket server {0} blocked")]
    Blocked(String),
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Producer handle for the session's outbound queue.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Message>,
}

impl EventSender {
    /// Encode and enqueue an event frame. Enqueueing must not block the
    /// caller beyond the send deadline: a full queue drops the frame.
    pub async fn send_event(&self, event: &str, body: &Value) {
        let text = match frame::encode_event(event, body) {
            Ok(text) => text,
            Err(e) => {
                info!("escapedString error: {e}");
                return;
            }
        };
        debug!("Event: {}, Message: {}", event, text);
        self.send_raw(Message::Text(text)).await;
    }

    async fn send_raw(&self, message: Message) {
        if self.tx.send_timeout(message, SEND_TIMEOUT).await.is_err() {
            warn!("Dropping message");
        }
    }
}

#[async_trait]
impl ResultSender for EventSender {
    async fn send(&self, event: &str, body: &Value) {
        self.send_event(event, body).await;
    }
}

// ---------------------------------------------------------------------------
// Task stop signals
// ---------------------------------------------------------------------------

struct StopEntry {
    tx: watch::Sender<bool>,
    fired: AtomicBool,
}

impl StopEntry {
    /// Fire the signal at most once, however many close paths race.
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(true);
        }
    }
}

/// Session-private table of per-task stop signals.
#[derive(Default)]
pub struct TaskTable {
    entries: Mutex<HashMap<String, Arc<StopEntry>>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new task. Rejects duplicates of a live task and refuses
    /// to grow past [`MAX_TRACKED_TASKS`].
    pub fn insert(&self, task_id: &str) -> Option<watch::Receiver<bool>> {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_TRACKED_TASKS {
            warn!("Task table full; dropping task {task_id}");
            return None;
        }
        if entries.contains_key(task_id) {
            warn!("Task {task_id} is already running; dropping duplicate request");
            return None;
        }
        let (tx, rx) = watch::channel(false);
        entries.insert(
            task_id.to_string(),
            Arc::new(StopEntry {
                tx,
                fired: AtomicBool::new(false),
            }),
        );
        Some(rx)
    }

    /// Fire a task's stop signal, leaving the entry for its owner to
    /// remove. Returns whether the task was known.
    pub fn fire(&self, task_id: &str) -> bool {
        let entry = self.entries.lock().get(task_id).cloned();
        match entry {
            Some(entry) => {
                entry.fire();
                true
            }
            None => false,
        }
    }

    /// Remove a finished task, firing its signal if nothing has yet.
    pub fn remove(&self, task_id: &str) {
        if let Some(entry) = self.entries.lock().remove(task_id) {
            entry.fire();
        }
    }

    /// Tear down every remaining task signal.
    pub fn stop_all(&self) {
        let entries: Vec<Arc<StopEntry>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.fire();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Outcome of dispatching one inbound event.
enum Dispatch {
    Continue,
    CloseConnection,
}

/// Connection-scoped handles shared with the dispatcher.
struct ConnContext {
    sender: EventSender,
    tasks: Arc<TaskTable>,
}

/// Fires and removes a task's stop signal when the task ends, however
/// it ends.
struct TaskGuard {
    tasks: Arc<TaskTable>,
    task_id: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tasks.remove(&self.task_id);
    }
}

/// A single control-plane session.
pub struct Session {
    agent: Arc<AgentIdentity>,
    runtime: Arc<RuntimeConfig>,
    registry: Arc<ProbeRegistry>,
    control: ControlClient,
    identity: Option<ClientIdentity>,
    updater: Arc<UpdateClient>,
    blocked_tx: watch::Sender<bool>,
    blocked_rx: watch::Receiver<bool>,
    dialer_times: u32,
    delay_time: Duration,
}

impl Session {
    pub fn new(
        agent: Arc<AgentIdentity>,
        runtime: Arc<RuntimeConfig>,
        registry: Arc<ProbeRegistry>,
        identity: Option<ClientIdentity>,
        updater: Arc<UpdateClient>,
    ) -> Result<Self, SessionError> {
        if agent.auth_code.is_empty() {
            return Err(SessionError::MissingAuthCode);
        }
        let control = ControlClient::new(
            agent.api_url.clone(),
            agent.api_secret.clone(),
            runtime.version.clone(),
            identity.clone(),
        );
        let (blocked_tx, blocked_rx) = watch::channel(false);
        Ok(Self {
            agent,
            runtime,
            registry,
            control,
            identity,
            updater,
            blocked_tx,
            blocked_rx,
            dialer_times: 0,
            delay_time: Duration::ZERO,
        })
    }

    /// Connect-and-reconnect loop. Returns only when the control plane
    /// blocks this node.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.dialer_times = 0;
        let (scheme, host) = scheme_host(&self.agent.api_url)?;

        loop {
            if *self.blocked_rx.borrow() {
                return Err(SessionError::Blocked(host));
            }
            if let Err(e) = self.connect(&scheme, &host).await {
                error!("Run session error: {e}");
            }
        }
    }

    /// One connection lifetime: backoff, token, dial, handshake, then
    /// the reader loop until the connection dies.
    async fn connect(&mut self, scheme: &str, host: &str) -> Result<(), SessionError> {
        self.apply_backoff().await;

        let token = match self.control.request_agent_token(&self.agent.auth_code).await {
            Ok(token) => token,
            Err(ControlError::Blocked) => {
                warn!("This node is blocked by the server.");
                let _ = self.blocked_tx.send(true);
                return Err(SessionError::Blocked(host.to_string()));
            }
            Err(e) => return Err(SessionError::Token(e)),
        };

        let url = format!(
            "{scheme}://{host}/socket.io/?token={}&auth_code={}{}",
            token.token,
            self.agent.auth_code,
            self.control.req_sign_query("/socket.io/")
        );

        let ws = self.dial(&url, scheme, host, &token).await?;
        if !self.agent.share_enable {
            info!("Successfully connected to the socket server: {host}");
        }

        let (sink, mut stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
        let (close_tx, mut close_rx) = watch::channel(false);
        let ctx = ConnContext {
            sender: EventSender { tx: out_tx },
            tasks: Arc::new(TaskTable::new()),
        };

        let writer = tokio::spawn(write_loop(out_rx, sink, close_tx.clone()));

        // The handshake is the first frame on every connection.
        ctx.sender
            .send_event("agent-task", &json!({ "token": token.token }))
            .await;

        let heartbeat_time: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let mut heartbeat_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        break;
                    }
                }
                msg = stream.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            error!("Read message error: {e}");
                            break;
                        }
                        None => break,
                    };
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Close(_) => {
                            warn!("Received a closed message");
                            break;
                        }
                        _ => continue,
                    };
                    let decoded = match frame::decode(&text) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            debug!("Failed to parse message: {e}");
                            continue;
                        }
                    };
                    match decoded {
                        Frame::Heartbeat => {
                            *heartbeat_time.lock() = Some(Instant::now());
                        }
                        Frame::Close => {
                            warn!("Received a closed message");
                            break;
                        }
                        Frame::Init(data) => {
                            if let InboundEvent::Init(init) = InboundEvent::classify("init", data) {
                                match init.ping_interval {
                                    None => error!("PingInterval error"),
                                    Some(interval) if heartbeat_task.is_none() => {
                                        heartbeat_task = Some(spawn_heartbeat(
                                            Duration::from_millis(interval as u64),
                                            heartbeat_time.clone(),
                                            ctx.sender.clone(),
                                            close_tx.clone(),
                                        ));
                                    }
                                    Some(_) => {}
                                }
                            }
                        }
                        Frame::Event { name, data } => {
                            let event = InboundEvent::classify(&name, data);
                            if matches!(self.dispatch(event, &ctx), Dispatch::CloseConnection) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(task) = heartbeat_task.take() {
            task.abort();
        }
        ctx.tasks.stop_all();
        // Dropping the writer closes the sink, which closes the socket.
        writer.abort();
        Ok(())
    }

    fn dispatch(&mut self, event: InboundEvent, ctx: &ConnContext) -> Dispatch {
        match event {
            InboundEvent::Init(_) => {}
            InboundEvent::Connect { sid } => {
                self.dialer_times = 0;
                info!("Connection sid is {sid}");
            }
            InboundEvent::Disconnect => {
                warn!("Handle disconnect event.");
                return Dispatch::CloseConnection;
            }
            InboundEvent::Disable => {
                warn!("Handle disable event.");
                return Dispatch::CloseConnection;
            }
            InboundEvent::Update => {
                warn!("Handle update event.");
                let updater = self.updater.clone();
                tokio::spawn(async move {
                    if let Err(e) = updater.apply().await {
                        warn!("DoUpdate error: {e}");
                    }
                });
            }
            InboundEvent::StopTask { task_id } => {
                ctx.tasks.fire(&task_id);
            }
            InboundEvent::Block => {
                warn!("Handle block event.");
                let _ = self.blocked_tx.send(true);
                return Dispatch::CloseConnection;
            }
            InboundEvent::ServerError { message } => {
                warn!("Received error message: {message}");
            }
            InboundEvent::AgentResponse(_) => {
                debug!("agent-response");
            }
            InboundEvent::Request { probe, data } => {
                self.spawn_task(&probe, data, ctx);
            }
            InboundEvent::Unknown { event, data } => {
                info!("Default event: [{event}] {data}");
            }
        }
        Dispatch::Continue
    }

    /// Accept a `request-<probe>` event: validate, register the stop
    /// signal, then run preprocess/ack/execute off the reader.
    fn spawn_task(&self, probe: &str, data: Value, ctx: &ConnContext) {
        let Some(handler) = self.registry.get(probe) else {
            info!("Default event: [request-{probe}] {data}");
            return;
        };
        if let Err(e) = handler.validate(&data) {
            warn!("handleEvent failed: {e}");
            return;
        }
        let Some(task_id) = data
            .get("taskId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            warn!("handleEvent failed: event data format invalid");
            return;
        };
        let Some(stop_rx) = ctx.tasks.insert(&task_id) else {
            return;
        };

        let sender = ctx.sender.clone();
        let guard = TaskGuard {
            tasks: ctx.tasks.clone(),
            task_id: task_id.clone(),
        };
        tokio::spawn(async move {
            // Dropped on every exit path, panics included.
            let _guard = guard;
            let prepared = match handler.preprocess(data).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!("handleEvent failed: {e}");
                    return;
                }
            };
            sender.send_event("agent-response", &prepared.ack).await;

            let result_sender: Arc<dyn ResultSender> = Arc::new(sender);
            if let Err(e) = handler
                .execute(&prepared.data, &task_id, stop_rx, result_sender)
                .await
            {
                warn!("Task {task_id} failed: {e}");
            }
        });
    }

    async fn dial(
        &self,
        url: &str,
        scheme: &str,
        host: &str,
        token: &TokenInfo,
    ) -> Result<WsStream, SessionError> {
        let (dial_host, dial_port) = split_ws_host(host, scheme);
        let stream = DualStackDialer::default()
            .dial(&dial_host, dial_port)
            .await
            .map_err(|e| SessionError::Dial {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
        if let Ok(value) = HeaderValue::from_str(&format!("Adm-agent/{}", self.runtime.version)) {
            request.headers_mut().insert(USER_AGENT, value);
        }
        if let Some(cookie) = token_cookie_header(token, url) {
            request.headers_mut().insert(COOKIE, cookie);
        }

        let connector = match &self.identity {
            Some(identity) => Some(Connector::Rustls(
                identity
                    .rustls_client_config()
                    .map_err(|e| SessionError::Dial {
                        host: host.to_string(),
                        message: e.to_string(),
                    })?,
            )),
            None => None,
        };

        let (ws, _response) = client_async_tls_with_config(request, stream, None, connector)
            .await
            .map_err(|e| SessionError::Dial {
                host: host.to_string(),
                message: e.to_string(),
            })?;
        Ok(ws)
    }

    async fn apply_backoff(&mut self) {
        self.delay_time = next_delay(self.dialer_times, self.delay_time);
        if !self.delay_time.is_zero() {
            tokio::time::sleep(self.delay_time).await;
        }
        self.dialer_times += 1;
    }
}

/// Backoff schedule: no delay on the first attempt, then 2 s doubling up
/// to 60 s.
pub(crate) fn next_delay(attempts: u32, current: Duration) -> Duration {
    if attempts == 0 {
        Duration::ZERO
    } else if attempts == 1 {
        INITIAL_RETRY_DELAY
    } else {
        (current * 2).min(MAX_RETRY_DELAY)
    }
}

/// Map the configured API URL onto the socket scheme and host.
pub(crate) fn scheme_host(api_url: &str) -> Result<(String, String), SessionError> {
    let url = url::Url::parse(api_url).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(SessionError::UnsupportedScheme(other.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidUrl(api_url.to_string()))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok((scheme.to_string(), host))
}

/// Split a `host[:port]` socket authority, defaulting the port from the
/// scheme.
fn split_ws_host(host: &str, scheme: &str) -> (String, u16) {
    let default_port = if scheme == "wss" { 443 } else { 80 };
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if let Some((name, port)) = host.rsplit_once(':') {
        if !name.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (name.to_string(), port);
            }
        }
    }
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    (trimmed.to_string(), default_port)
}

/// Cookies the token endpoint set, rendered for the socket upgrade.
fn token_cookie_header(token: &TokenInfo, ws_url: &str) -> Option<HeaderValue> {
    use reqwest::cookie::CookieStore;

    let http_url = ws_url.replacen("ws", "http", 1);
    let url = reqwest::Url::parse(&http_url).ok()?;
    let cookies = token.cookies.cookies(&url)?;
    HeaderValue::from_bytes(cookies.as_bytes()).ok()
}

fn spawn_heartbeat(
    interval: Duration,
    heartbeat_time: Arc<Mutex<Option<Instant>>>,
    sender: EventSender,
    close_tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        // Skip the immediate tick to align with the advertised interval.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_stale(*heartbeat_time.lock()) {
                error!(
                    "Heartbeat timeout after {}s. Reconnect.",
                    HEARTBEAT_STALE_AFTER.as_secs()
                );
                let _ = close_tx.send(true);
                return;
            }
            sender
                .send_raw(Message::Text(frame::HEARTBEAT_FRAME.to_string()))
                .await;
        }
    })
}

/// A set heartbeat clock older than the staleness window means the peer
/// went quiet.
fn heartbeat_stale(last: Option<Instant>) -> bool {
    last.is_some_and(|t| t.elapsed() > HEARTBEAT_STALE_AFTER)
}

async fn write_loop(
    mut rx: mpsc::Receiver<Message>,
    mut sink: WsSink,
    close_tx: watch::Sender<bool>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            error!("Error writing message: {e}");
            let _ = close_tx.send(true);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut delay = Duration::ZERO;
        let mut observed = Vec::new();
        for attempt in 0..8 {
            delay = next_delay(attempt, delay);
            observed.push(delay.as_secs());
        }
        assert_eq!(observed, vec![0, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_scheme_host_mapping() {
        assert_eq!(
            scheme_host("https://api.example.com").unwrap(),
            ("wss".to_string(), "api.example.com".to_string())
        );
        assert_eq!(
            scheme_host("http://api.example.com:8080").unwrap(),
            ("ws".to_string(), "api.example.com:8080".to_string())
        );
        assert!(matches!(
            scheme_host("ftp://api.example.com"),
            Err(SessionError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            scheme_host("not a url"),
            Err(SessionError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_split_ws_host() {
        assert_eq!(split_ws_host("example.com", "wss"), ("example.com".into(), 443));
        assert_eq!(split_ws_host("example.com", "ws"), ("example.com".into(), 80));
        assert_eq!(
            split_ws_host("example.com:9443", "wss"),
            ("example.com".into(), 9443)
        );
        assert_eq!(split_ws_host("[::1]:9443", "wss"), ("::1".into(), 9443));
    }

    #[test]
    fn test_task_table_insert_and_duplicate() {
        let table = TaskTable::new();
        assert!(table.insert("t1").is_some());
        assert!(table.insert("t1").is_none());
        assert_eq!(table.len(), 1);

        table.remove("t1");
        assert!(table.is_empty());
        // Re-registration after teardown is allowed.
        assert!(table.insert("t1").is_some());
    }

    #[test]
    fn test_task_table_fires_exactly_once() {
        let table = TaskTable::new();
        let mut rx = table.insert("t1").unwrap();

        assert!(table.fire("t1"));
        assert!(table.fire("t1"));
        table.remove("t1");

        // Only one transition was published.
        assert!(rx.has_changed().unwrap_or(false));
        assert!(*rx.borrow_and_update());
        assert!(!rx.has_changed().unwrap_or(true));
    }

    #[test]
    fn test_task_table_unknown_task() {
        let table = TaskTable::new();
        assert!(!table.fire("missing"));
        table.remove("missing");
    }

    #[test]
    fn test_task_table_enforces_cap() {
        let table = TaskTable::new();
        for i in 0..MAX_TRACKED_TASKS {
            assert!(table.insert(&format!("t{i}")).is_some());
        }
        assert!(table.insert("overflow").is_none());
        assert_eq!(table.len(), MAX_TRACKED_TASKS);
    }

    #[test]
    fn test_heartbeat_staleness() {
        assert!(!heartbeat_stale(None));
        assert!(!heartbeat_stale(Some(Instant::now())));
        let old = Instant::now().checked_sub(Duration::from_secs(21));
        if let Some(old) = old {
            assert!(heartbeat_stale(Some(old)));
        }
    }

    #[test]
    fn test_session_requires_auth_code() {
        let agent = Arc::new(AgentIdentity {
            api_url: "https://api.example.com".to_string(),
            ..Default::default()
        });
        let runtime = Arc::new(RuntimeConfig::new("0.0.0", "prod"));
        let registry = Arc::new(ProbeRegistry::new());
        let updater = Arc::new(UpdateClient::new(&runtime));
        let result = Session::new(agent, runtime, registry, None, updater);
        assert!(matches!(result, Err(SessionError::MissingAuthCode)));
    }
}
