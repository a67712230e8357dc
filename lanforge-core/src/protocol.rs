//! Wire codec (C1, spec.md §4.1).
//!
//! A closed tagged union over the frame enumeration (spec.md §9's redesign
//! note), generalized from the teacher's open `Envelope<T>` pattern in
//! `p2p-core`'s old `protocol.rs`. A frame is one line of UTF-8 JSON:
//!
//! ```json
//! {"requestId":"r1","clientId":"pending","type":"HELLO","payload":{"deviceId":"d1","name":"Alice"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::ids::{ClientId, DeviceId, JoinCode};
use crate::room::Snapshot;

/// Milliseconds since the Unix epoch, used for chat/heartbeat timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One frame on the reliable transport: request id + sender identity +
/// a closed, internally-tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub request_id: String,
    pub client_id: ClientId,
    #[serde(flatten)]
    pub payload: FramePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FramePayload {
    Hello(HelloPayload),
    Welcome(WelcomePayload),
    Ping(TimestampPayload),
    Pong(TimestampPayload),
    Error(ErrorPayload),
    CreateRoom(CreateRoomPayload),
    JoinRoom(JoinRoomPayload),
    LeaveRoom(LeaveRoomPayload),
    Chat(ChatPayload),
    Kick(KickPayload),
    Kicked(KickedPayload),
    StateSnapshot(StateSnapshotPayload),
}

impl FramePayload {
    /// The frame type name as it appears on the wire, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FramePayload::Hello(_) => "HELLO",
            FramePayload::Welcome(_) => "WELCOME",
            FramePayload::Ping(_) => "PING",
            FramePayload::Pong(_) => "PONG",
            FramePayload::Error(_) => "ERROR",
            FramePayload::CreateRoom(_) => "CREATE_ROOM",
            FramePayload::JoinRoom(_) => "JOIN_ROOM",
            FramePayload::LeaveRoom(_) => "LEAVE_ROOM",
            FramePayload::Chat(_) => "CHAT",
            FramePayload::Kick(_) => "KICK",
            FramePayload::Kicked(_) => "KICKED",
            FramePayload::StateSnapshot(_) => "STATE_SNAPSHOT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_id: DeviceId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampPayload {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub max_players: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub join_code: JoinCode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LeaveRoomPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPayload {
    pub target_device_id: DeviceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshotPayload {
    pub snapshot: Snapshot,
}

impl Frame {
    pub fn new(request_id: impl Into<String>, client_id: ClientId, payload: FramePayload) -> Self {
        Self {
            request_id: request_id.into(),
            client_id,
            payload,
        }
    }

    pub fn hello(request_id: impl Into<String>, device_id: DeviceId, name: String) -> Self {
        Self::new(
            request_id,
            ClientId::pending(),
            FramePayload::Hello(HelloPayload { device_id, name }),
        )
    }

    pub fn welcome(request_id: impl Into<String>, client_id: ClientId) -> Self {
        Self::new(
            request_id,
            ClientId::server(),
            FramePayload::Welcome(WelcomePayload { client_id }),
        )
    }

    pub fn ping(request_id: impl Into<String>, client_id: ClientId, timestamp: u64) -> Self {
        Self::new(
            request_id,
            client_id,
            FramePayload::Ping(TimestampPayload { timestamp }),
        )
    }

    pub fn pong(request_id: impl Into<String>, client_id: ClientId, timestamp: u64) -> Self {
        Self::new(
            request_id,
            client_id,
            FramePayload::Pong(TimestampPayload { timestamp }),
        )
    }

    pub fn error(request_id: impl Into<String>, reason: impl Into<String>, code: Option<&str>) -> Self {
        Self::new(
            request_id,
            ClientId::server(),
            FramePayload::Error(ErrorPayload {
                reason: reason.into(),
                code: code.map(|c| c.to_string()),
            }),
        )
    }

    pub fn kicked(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            request_id,
            ClientId::server(),
            FramePayload::Kicked(KickedPayload {
                reason: reason.into(),
            }),
        )
    }

    pub fn state_snapshot(request_id: impl Into<String>, snapshot: Snapshot) -> Self {
        Self::new(
            request_id,
            ClientId::server(),
            FramePayload::StateSnapshot(StateSnapshotPayload { snapshot }),
        )
    }

    pub fn chat_broadcast(
        request_id: impl Into<String>,
        from_device_id: DeviceId,
        from_name: String,
        text: String,
        timestamp: u64,
    ) -> Self {
        Self::new(
            request_id,
            ClientId::server(),
            FramePayload::Chat(ChatPayload {
                text,
                from_device_id: Some(from_device_id),
                from_name: Some(from_name),
                timestamp: Some(timestamp),
            }),
        )
    }
}

/// Decodes one wire line into a `Frame`. Any structural problem — not an
/// object, unknown/missing `type`, non-string `requestId`, non-object
/// `payload` — is reported as `ProtocolError::MalformedFrame`; it never
/// panics and never aborts the caller's event loop.
pub fn decode_frame(line: &str) -> Result<Frame, ProtocolError> {
    serde_json::from_str::<Frame>(line).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

/// Encodes a `Frame` to its single-line wire form.
pub fn encode_frame(frame: &Frame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_hello_frame() {
        let frame = Frame::hello("r1", DeviceId::from("dev-a"), "Alice".to_string());
        let line = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&line).unwrap();
        assert_eq!(decoded.request_id, "r1");
        match decoded.payload {
            FramePayload::Hello(h) => {
                assert_eq!(h.device_id, DeviceId::from("dev-a"));
                assert_eq!(h.name, "Alice");
            }
            other => panic!("expected HELLO, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_object_lines() {
        let err = decode_frame("\"just a string\"").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = r#"{"requestId":"r1","clientId":"pending","type":"NOT_A_TYPE","payload":{}}"#;
        assert!(decode_frame(raw).is_err());
    }

    #[test]
    fn rejects_missing_request_id() {
        let raw = r#"{"clientId":"pending","type":"LEAVE_ROOM","payload":{}}"#;
        assert!(decode_frame(raw).is_err());
    }

    #[test]
    fn rejects_non_object_payload() {
        let raw = r#"{"requestId":"r1","clientId":"pending","type":"HELLO","payload":"nope"}"#;
        assert!(decode_frame(raw).is_err());
    }

    #[test]
    fn decode_then_encode_preserves_semantics() {
        let raw = r#"{"requestId":"r7","clientId":"server","type":"CHAT","payload":{"text":"hi","fromDeviceId":"dev-b","fromName":"Bob","timestamp":42}}"#;
        let decoded = decode_frame(raw).unwrap();
        let re_encoded = encode_frame(&decoded).unwrap();
        let re_decoded = decode_frame(&re_encoded).unwrap();
        match (decoded.payload, re_decoded.payload) {
            (FramePayload::Chat(a), FramePayload::Chat(b)) => {
                assert_eq!(a.text, b.text);
                assert_eq!(a.from_device_id, b.from_device_id);
                assert_eq!(a.from_name, b.from_name);
                assert_eq!(a.timestamp, b.timestamp);
            }
            _ => panic!("expected CHAT both ways"),
        }
    }
}
