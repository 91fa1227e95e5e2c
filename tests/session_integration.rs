//! Session runtime scenarios against a stub control plane.
//!
//! One listener plays both control-plane roles: plain HTTP for the
//! agent-token endpoint and a WebSocket accept loop for the socket
//! session. Every text frame the agent sends is forwarded to the test
//! through a channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use adm_agent::config::{AgentIdentity, RuntimeConfig};
use adm_agent::probes::ping::PingHandler;
use adm_agent::probes::ProbeRegistry;
use adm_agent::session::{Session, SessionError};
use adm_agent::update::UpdateClient;

const TOKEN_OK: &str = r#"{"success":true,"message":"","code":200,"data":{"token":"tok-1"}}"#;
const TOKEN_BLOCKED: &str = r#"{"success":false,"message":"node blocked","code":20015}"#;
const INIT_FRAME: &str = r#"0{"sid":"srv-1","pingInterval":60000}"#;

/// Marker the stub pushes whenever a socket connection is accepted.
const CONNECTED_MARKER: &str = "<<connected>>";

/// A frame the stub sends after the agent's handshake, following an
/// optional pause.
struct ScriptedEvent {
    delay: Duration,
    frame: String,
}

impl ScriptedEvent {
    fn now(frame: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            frame: frame.into(),
        }
    }

    fn after(delay: Duration, frame: impl Into<String>) -> Self {
        Self { delay, frame: frame.into() }
    }
}

/// Spawn the stub control plane. Returns its port; agent frames (and
/// connection markers) arrive on the returned channel.
async fn spawn_control_plane(
    token_body: &'static str,
    script: Vec<ScriptedEvent>,
) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let script = Arc::new(script);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let frames_tx = frames_tx.clone();
            let script = script.clone();
            tokio::spawn(async move {
                if peek_is_socket_upgrade(&stream).await {
                    serve_socket(stream, frames_tx, &script).await;
                } else {
                    serve_token(stream, token_body).await;
                }
            });
        }
    });

    (port, frames_rx)
}

async fn peek_is_socket_upgrade(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 64];
    for _ in 0..50 {
        let Ok(n) = stream.peek(&mut buf).await else {
            return false;
        };
        if n >= 15 {
            return buf.starts_with(b"GET /socket.io/");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn serve_token(mut stream: TcpStream, body: &str) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let Ok(n) = stream.read(&mut buf).await else {
            return;
        };
        if n == 0 {
            return;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

async fn serve_socket(
    stream: TcpStream,
    frames_tx: mpsc::UnboundedSender<String>,
    script: &[ScriptedEvent],
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let _ = frames_tx.send(CONNECTED_MARKER.to_string());
    let (mut sink, mut read) = ws.split();

    if sink.send(Message::Text(INIT_FRAME.to_string())).await.is_err() {
        return;
    }

    // The handshake frame comes first on every connection.
    match read.next().await {
        Some(Ok(Message::Text(text))) => {
            let _ = frames_tx.send(text);
        }
        _ => return,
    }

    let forward = async {
        while let Some(Ok(message)) = read.next().await {
            if let Message::Text(text) = message {
                let _ = frames_tx.send(text);
            }
        }
    };
    let drive = async {
        for event in script {
            if !event.delay.is_zero() {
                tokio::time::sleep(event.delay).await;
            }
            if sink.send(Message::Text(event.frame.clone())).await.is_err() {
                return;
            }
        }
        // Keep the connection open for the agent's result frames.
        tokio::time::sleep(Duration::from_secs(60)).await;
    };
    tokio::join!(forward, drive);
}

fn spawn_session(port: u16) -> tokio::task::JoinHandle<Result<(), SessionError>> {
    let agent = Arc::new(AgentIdentity {
        api_url: format!("http://127.0.0.1:{port}"),
        auth_code: "ac-1".to_string(),
        ..Default::default()
    });
    let runtime = Arc::new(RuntimeConfig::new("0.0.0", "prod"));
    let registry = Arc::new(ProbeRegistry::new());
    registry.register(Arc::new(PingHandler::new(runtime.clone())));
    let updater = Arc::new(UpdateClient::new(&runtime));

    let mut session = Session::new(agent, runtime, registry, None, updater).unwrap();
    tokio::spawn(async move { session.run().await })
}

/// Unwrap an outbound event frame into its name and `res` body.
fn decode_outbound(frame: &str) -> (String, Value) {
    let start = frame.find("[\"").expect("event frame");
    let (name, payload): (String, String) = serde_json::from_str(&frame[start..]).unwrap();
    let body: Value = serde_json::from_str(&payload).unwrap();
    (name, body["res"].clone())
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>, wait: Duration) -> Option<String> {
    tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
}

/// A TCP target the ping probe can reach.
async fn spawn_ping_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });
    port
}

#[tokio::test]
async fn blocked_token_terminates_the_session() {
    let (port, _frames) = spawn_control_plane(TOKEN_BLOCKED, Vec::new()).await;
    let session = spawn_session(port);

    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session should exit promptly")
        .unwrap();
    match result {
        Err(SessionError::Blocked(host)) => assert!(host.contains("127.0.0.1")),
        other => panic!("expected blocked termination, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_is_first_then_ack_then_result() {
    let target_port = spawn_ping_target().await;
    let request = format!(
        r#"42/agent,["request-ping",{{"host":"127.0.0.1:{target_port}","protocol":"tcp","pingtype":"once","taskId":"t2"}}]"#
    );
    let (port, mut frames) =
        spawn_control_plane(TOKEN_OK, vec![ScriptedEvent::now(request)]).await;
    let session = spawn_session(port);

    assert_eq!(
        next_frame(&mut frames, Duration::from_secs(5)).await.as_deref(),
        Some(CONNECTED_MARKER)
    );

    let handshake = next_frame(&mut frames, Duration::from_secs(5)).await.unwrap();
    let (event, body) = decode_outbound(&handshake);
    assert_eq!(event, "agent-task");
    assert_eq!(body["token"], "tok-1");

    let ack_frame = next_frame(&mut frames, Duration::from_secs(5)).await.unwrap();
    let (event, ack) = decode_outbound(&ack_frame);
    assert_eq!(event, "agent-response");
    assert_eq!(ack["ip"], "127.0.0.1");
    assert_eq!(ack["port"], target_port.to_string());
    assert_eq!(ack["ipVersion"], "IPv4");
    assert_eq!(ack["taskType"], "ping");
    assert_eq!(ack["taskId"], "t2");

    let result_frame = next_frame(&mut frames, Duration::from_secs(5)).await.unwrap();
    let (event, result) = decode_outbound(&result_frame);
    assert_eq!(event, "agent-response");
    assert!(result["delay"].as_f64().unwrap() >= 0.0);
    assert_eq!(result["taskType"], "ping");
    assert_eq!(result["taskId"], "t2");

    session.abort();
}

#[tokio::test]
async fn stop_task_cuts_a_continuous_ping_short() {
    let target_port = spawn_ping_target().await;
    let request = format!(
        r#"42/agent,["request-ping",{{"host":"127.0.0.1:{target_port}","protocol":"tcp","pingtype":"continuous","taskId":"t3"}}]"#
    );
    let stop = r#"42/agent,["stop-task","t3"]"#.to_string();
    let (port, mut frames) = spawn_control_plane(
        TOKEN_OK,
        vec![
            ScriptedEvent::now(request),
            ScriptedEvent::after(Duration::from_millis(2600), stop),
        ],
    )
    .await;
    let session = spawn_session(port);

    // Drain frames for long enough that an unstopped run would emit far
    // more iterations.
    let mut results = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(7);
    while let Ok(Some(frame)) =
        tokio::time::timeout_at(deadline, frames.recv()).await
    {
        if frame == CONNECTED_MARKER {
            continue;
        }
        let (event, body) = decode_outbound(&frame);
        if event == "agent-response" && body.get("delay").is_some() {
            results += 1;
        }
    }

    assert!(results >= 2, "expected a few iterations, got {results}");
    assert!(
        results <= 5,
        "stop-task should end the run early, got {results} results"
    );
    session.abort();
}

#[tokio::test]
async fn reconnect_sends_a_fresh_handshake_first() {
    // The server closes each session right after the handshake; the
    // agent must reconnect and lead with agent-task again.
    let (port, mut frames) =
        spawn_control_plane(TOKEN_OK, vec![ScriptedEvent::now("41")]).await;
    let session = spawn_session(port);

    for connection in 0..2 {
        assert_eq!(
            next_frame(&mut frames, Duration::from_secs(10)).await.as_deref(),
            Some(CONNECTED_MARKER),
            "connection {connection} not established"
        );
        let first = next_frame(&mut frames, Duration::from_secs(10)).await.unwrap();
        let (event, body) = decode_outbound(&first);
        assert_eq!(event, "agent-task", "connection {connection}");
        assert_eq!(body["token"], "tok-1");
    }

    session.abort();
}
