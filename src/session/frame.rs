//! Frame codec
//!
//! The narrow Socket.IO-flavored framing this agent speaks. Outbound
//! events go to the `/agent` namespace with a payload that is the JSON
//! string of a JSON string (the server requires the double encoding).
//! Inbound frames are classified by shape; anything else is a decode
//! error the session drops at debug level.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Upper bound on an inbound frame before any parsing happens.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Outbound heartbeat frame.
pub const HEARTBEAT_FRAME: &str = "2/agent";

/// Numeric prefix the server uses to end a session.
const CLOSE_CODE: u64 = 41;

static EVENT_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\d+(/agent,)?\["[^"]+",\{.*\}\]$"#).expect("event json regex")
});
static EVENT_STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\d+(/agent,)?\["[^"]+",".*"\]$"#).expect("event string regex")
});
static INIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\{.*\}$").expect("init regex"));
static HEARTBEAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[^\d\[]*$").expect("heartbeat regex"));

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
    TooLong(usize),

    #[error("invalid message format: {0}")]
    Malformed(String),

    #[error("error parsing JSON data: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Named event with its payload (object or string).
    Event { name: String, data: Value },
    /// Session parameters sent right after the upgrade.
    Init(Value),
    /// Liveness signal; refreshes the heartbeat clock.
    Heartbeat,
    /// Server-initiated close.
    Close,
}

/// Encode an outbound event frame.
///
/// The payload slot carries `{"res": body}` serialized twice: once to
/// JSON, then again as a JSON string.
pub fn encode_event(event: &str, body: &Value) -> Result<String, FrameError> {
    let wrapped = serde_json::json!({ "res": body });
    let inner = serde_json::to_string(&wrapped)?;
    let escaped = serde_json::to_string(&inner)?;
    Ok(format!("42/agent,[\"{event}\",{escaped}]"))
}

/// Classify and decode one inbound text frame.
pub fn decode(message: &str) -> Result<Frame, FrameError> {
    if message.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong(message.len()));
    }

    if EVENT_JSON_RE.is_match(message) || EVENT_STRING_RE.is_match(message) {
        let start = message
            .find("[\"")
            .ok_or_else(|| FrameError::Malformed(message.to_string()))?;
        let (name, data): (String, Value) = serde_json::from_str(&message[start..])?;
        return Ok(Frame::Event { name, data });
    }

    if INIT_RE.is_match(message) {
        let start = message
            .find('{')
            .ok_or_else(|| FrameError::Malformed(message.to_string()))?;
        let data: Value = serde_json::from_str(&message[start..])?;
        return Ok(Frame::Init(data));
    }

    if HEARTBEAT_RE.is_match(message) {
        let digits: String = message.chars().take_while(|c| c.is_ascii_digit()).collect();
        let code = digits.parse::<u64>().unwrap_or(0);
        if code == CLOSE_CODE {
            return Ok(Frame::Close);
        }
        return Ok(Frame::Heartbeat);
    }

    Err(FrameError::Malformed(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_event_double_stringifies_payload() {
        let frame = encode_event("agent-task", &json!({"token": "abc"})).unwrap();
        assert!(frame.starts_with("42/agent,[\"agent-task\","));

        // Peel the payload back: outer string, then the res wrapper.
        let start = frame.find("[\"").unwrap();
        let (name, payload): (String, String) = serde_json::from_str(&frame[start..]).unwrap();
        assert_eq!(name, "agent-task");
        let body: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(body["res"]["token"], "abc");
    }

    #[test]
    fn test_decode_json_event() {
        let frame =
            decode(r#"42/agent,["request-ping",{"host":"1.1.1.1","taskId":"t1"}]"#).unwrap();
        match frame {
            Frame::Event { name, data } => {
                assert_eq!(name, "request-ping");
                assert_eq!(data["host"], "1.1.1.1");
                assert_eq!(data["taskId"], "t1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_json_event_without_namespace() {
        let frame = decode(r#"42["request-ping",{"host":"1.1.1.1"}]"#).unwrap();
        assert!(matches!(frame, Frame::Event { .. }));
    }

    #[test]
    fn test_decode_string_event() {
        let frame = decode(r#"42/agent,["stop-task","t3"]"#).unwrap();
        match frame {
            Frame::Event { name, data } => {
                assert_eq!(name, "stop-task");
                assert_eq!(data, Value::String("t3".to_string()));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_init() {
        let frame = decode(r#"0{"sid":"abc","pingInterval":25000}"#).unwrap();
        match frame {
            Frame::Init(data) => assert_eq!(data["pingInterval"], 25000),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_heartbeats() {
        assert_eq!(decode("2").unwrap(), Frame::Heartbeat);
        assert_eq!(decode("3").unwrap(), Frame::Heartbeat);
        assert_eq!(decode("2/agent").unwrap(), Frame::Heartbeat);
        assert_eq!(decode("40/agent,").unwrap(), Frame::Heartbeat);
    }

    #[test]
    fn test_decode_close_code() {
        assert_eq!(decode("41").unwrap(), Frame::Close);
        assert_eq!(decode("41/agent,").unwrap(), Frame::Close);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode("garbage"), Err(FrameError::Malformed(_))));
        assert!(matches!(decode(""), Err(FrameError::Malformed(_))));
        // Digit-led but with a broken event body.
        assert!(decode(r#"42/agent,["broken"#).is_err());
    }

    #[test]
    fn test_decode_enforces_frame_cap() {
        let oversized = format!("42/agent,[\"x\",\"{}\"]", "a".repeat(MAX_FRAME_LEN));
        assert!(matches!(decode(&oversized), Err(FrameError::TooLong(_))));
    }
}
