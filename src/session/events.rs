//! Inbound event typing
//!
//! Each named event the control plane sends maps to one variant with a
//! strictly typed payload, replacing per-field type assertions with one
//! classification step the dispatcher can match on.

use serde::Deserialize;
use serde_json::Value;

/// Payload of the `init` packet.
#[derive(Debug, Default, Deserialize)]
pub struct InitData {
    #[serde(rename = "pingInterval")]
    pub ping_interval: Option<f64>,
    #[serde(rename = "pingTimeout", default)]
    pub ping_timeout: Option<f64>,
    #[serde(default)]
    pub sid: Option<String>,
}

/// A classified inbound event.
#[derive(Debug)]
pub enum InboundEvent {
    /// Session parameters; starts the heartbeat.
    Init(InitData),
    /// Namespace connect acknowledgement carrying the session id.
    Connect { sid: String },
    /// Server asked us to drop the connection.
    Disconnect,
    /// Node disabled; same handling as disconnect.
    Disable,
    /// Server requested a self-update.
    Update,
    /// Stop one running task by id.
    StopTask { task_id: String },
    /// Node blocked; the session terminates for good.
    Block,
    /// Error message from the server.
    ServerError { message: String },
    /// Echo of one of our own result frames.
    AgentResponse(Value),
    /// A `request-<probe>` task request.
    Request { probe: String, data: Value },
    /// Anything we do not recognize.
    Unknown { event: String, data: Value },
}

impl InboundEvent {
    /// Map an event name and payload onto a variant.
    pub fn classify(event: &str, data: Value) -> Self {
        match event {
            "init" => Self::Init(serde_json::from_value(data).unwrap_or_default()),
            "connect" => Self::Connect {
                sid: data.as_str().unwrap_or_default().to_string(),
            },
            "disconnect" => Self::Disconnect,
            "disable" => Self::Disable,
            "update" => Self::Update,
            "stop-task" => Self::StopTask {
                task_id: data.as_str().unwrap_or_default().to_string(),
            },
            "block" => Self::Block,
            "err" => Self::ServerError {
                message: data.as_str().unwrap_or_default().to_string(),
            },
            "agent-response" => Self::AgentResponse(data),
            _ => match event.strip_prefix("request-") {
                Some(probe) if !probe.is_empty() => Self::Request {
                    probe: probe.to_string(),
                    data,
                },
                _ => Self::Unknown {
                    event: event.to_string(),
                    data,
                },
            },
        }
    }
}
