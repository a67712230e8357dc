//! Closed error taxonomy (spec.md §7). Each variant is a `thiserror` variant
//! whose `Display` text matches the user-facing ERROR reason spec.md quotes.

use thiserror::Error;

use crate::ids::{ClientId, DeviceId, RoomId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("INVALID_JOIN_CODE: no room with that join code")]
    InvalidJoinCode,

    #[error("NAME_CONFLICT: that name is already in use in this room")]
    NameConflict,

    #[error("NOT_HOST: only the current host may do that")]
    NotHost,

    #[error("NOT_IN_ROOM: device is not a member of this room")]
    NotInRoom,

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("no join codes are available")]
    JoinCodesExhausted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Must send HELLO first")]
    Unauthenticated,

    #[error("Unsupported message type")]
    UnsupportedMessageType,

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error(transparent)]
    Room(#[from] RoomError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("migration abandoned: no cached snapshot or client id for device {device_id}")]
    MigrationAbandoned { device_id: DeviceId },

    #[error("no active connection for client {0}")]
    NotConnected(ClientId),
}

/// Error code carried on an ERROR frame's optional `code` field, for clients
/// that want to branch on it instead of parsing `reason` text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MalformedFrame,
    Unauthenticated,
    InvalidJoinCode,
    NameConflict,
    NotHost,
    NotInRoom,
    UnsupportedMessageType,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedFrame => "MALFORMED_FRAME",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::InvalidJoinCode => "INVALID_JOIN_CODE",
            ErrorCode::NameConflict => "NAME_CONFLICT",
            ErrorCode::NotHost => "NOT_HOST",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::UnsupportedMessageType => "UNSUPPORTED_MESSAGE_TYPE",
        }
    }
}

impl From<&RoomError> for ErrorCode {
    fn from(e: &RoomError) -> Self {
        match e {
            RoomError::InvalidJoinCode => ErrorCode::InvalidJoinCode,
            RoomError::NameConflict => ErrorCode::NameConflict,
            RoomError::NotHost => ErrorCode::NotHost,
            RoomError::NotInRoom => ErrorCode::NotInRoom,
            RoomError::RoomNotFound(_) => ErrorCode::InvalidJoinCode,
            RoomError::JoinCodesExhausted => ErrorCode::InvalidJoinCode,
        }
    }
}
