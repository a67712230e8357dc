//! Opaque identifiers (spec.md §3). Each is a thin newtype over `String` so
//! the type checker keeps a `DeviceId` from being passed where a `ClientId`
//! is expected, while the wire format stays a plain JSON string.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(DeviceId);
opaque_id!(ClientId);
opaque_id!(RoomId);
opaque_id!(JoinCode);

/// Sentinel `clientId` used on coordinator-originated frames (spec.md §4.1).
pub const CLIENT_ID_SERVER: &str = "server";
/// Sentinel `clientId` used before a connection has completed HELLO.
pub const CLIENT_ID_PENDING: &str = "pending";

impl ClientId {
    pub fn server() -> Self {
        Self(CLIENT_ID_SERVER.to_string())
    }

    pub fn pending() -> Self {
        Self(CLIENT_ID_PENDING.to_string())
    }

    pub fn is_pending(&self) -> bool {
        self.0 == CLIENT_ID_PENDING
    }
}

/// A fresh random `ClientId`, assigned by the coordinator at accept time.
pub fn fresh_client_id() -> ClientId {
    ClientId(uuid::Uuid::new_v4().to_string())
}

/// A fresh random `RoomId`, assigned by the coordinator at room creation.
pub fn fresh_room_id() -> RoomId {
    RoomId(format!("room-{}", uuid::Uuid::new_v4()))
}
