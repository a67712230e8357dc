//! LanForge session-continuity engine: wire codec, room model, discovery,
//! coordinator and peer engine (spec.md §2).

pub mod coordinator;
pub mod discovery;
pub mod election;
pub mod error;
pub mod ids;
pub mod peer;
pub mod protocol;
pub mod room;

pub use error::{CoordinatorError, PeerError, ProtocolError, RoomError};
pub use ids::{ClientId, DeviceId, JoinCode, RoomId};
pub use peer::{PeerConfig, PeerHandle, UiEvent};
pub use protocol::{Frame, FramePayload};
pub use room::{Room, RoomRegistry, Snapshot};
