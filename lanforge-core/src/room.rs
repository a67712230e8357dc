//! Room model (C3, spec.md §3, §4.3).
//!
//! Pure in-memory state, single-threaded by construction: the coordinator
//! (C4) is the only caller, and it serializes every mutation through its own
//! command loop, so nothing here takes a lock. Every operation either
//! mutates to a fully valid `Room` or returns an error — never partially.

use std::collections::{BTreeMap, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::election::{elect, Candidate};
use crate::error::RoomError;
use crate::ids::{fresh_room_id, ClientId, DeviceId, JoinCode, RoomId};
use crate::protocol::now_ms;

/// Chat buffer capacity (spec.md §3 invariant 5).
pub const CHAT_CAPACITY: usize = 50;

const JOIN_CODE_LEN: usize = 6;
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const JOIN_CODE_MAX_ATTEMPTS: usize = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub device_id: DeviceId,
    pub client_id: ClientId,
    pub name: String,
    pub join_order: u64,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub from_device_id: DeviceId,
    pub from_name: String,
    pub text: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: RoomId,
    pub join_code: JoinCode,
    pub host_device_id: DeviceId,
    pub members: Vec<Member>,
    pub chat: VecDeque<ChatEntry>,
    /// Opaque game-module state (spec.md §3.1); the room model never reads it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<serde_json::Value>,
}

impl Room {
    pub fn member(&self, device_id: &DeviceId) -> Option<&Member> {
        self.members.iter().find(|m| &m.device_id == device_id)
    }

    fn member_mut(&mut self, device_id: &DeviceId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| &m.device_id == device_id)
    }

    fn candidates(&self) -> Vec<Candidate> {
        self.members
            .iter()
            .map(|m| Candidate {
                device_id: m.device_id.clone(),
                join_order: m.join_order,
            })
            .collect()
    }

    /// Rewrites `hostDeviceId` and every member's `role` to reflect
    /// `new_host` directly, without re-running election — for callers that
    /// already know the winner (spec.md §3 invariant 1: exactly one host,
    /// whose `deviceId` matches `hostDeviceId`).
    pub fn reassign_host(&mut self, new_host: &DeviceId) {
        self.host_device_id = new_host.clone();
        for m in self.members.iter_mut() {
            m.role = if &m.device_id == new_host {
                Role::Host
            } else {
                Role::Member
            };
        }
    }
}

/// The complete replicated datum: the room (including its chat buffer) plus
/// the two derived identity lookup tables. Receivers treat the lookups as
/// authoritative and rebuild them from the room on restore rather than
/// trusting anything cached (spec.md §3 invariant 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub room: Room,
    pub device_to_client: BTreeMap<String, ClientId>,
    pub device_to_name: BTreeMap<String, String>,
}

impl Snapshot {
    fn from_room(room: Room) -> Self {
        let mut device_to_client = BTreeMap::new();
        let mut device_to_name = BTreeMap::new();
        for m in &room.members {
            device_to_client.insert(m.device_id.0.clone(), m.client_id.clone());
            device_to_name.insert(m.device_id.0.clone(), m.name.clone());
        }
        Self {
            room,
            device_to_client,
            device_to_name,
        }
    }
}

/// All rooms live on one coordinator. `joinOrder` is a single counter shared
/// across every room this registry hosts (spec.md §3: "a coordinator-wide
/// counter"), and join codes are unique across every room it hosts.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, Room>,
    join_codes: BTreeMap<String, RoomId>,
    next_join_order: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(&room_id.0)
    }

    fn take_join_order(&mut self) -> u64 {
        let order = self.next_join_order;
        self.next_join_order += 1;
        order
    }

    fn allocate_join_code(&self) -> Result<JoinCode, RoomError> {
        let mut rng = rand::thread_rng();
        for _ in 0..JOIN_CODE_MAX_ATTEMPTS {
            let code: String = (0..JOIN_CODE_LEN)
                .map(|_| {
                    let idx = rng.gen_range(0..JOIN_CODE_ALPHABET.len());
                    JOIN_CODE_ALPHABET[idx] as char
                })
                .collect();
            if !self.join_codes.contains_key(&code) {
                return Ok(JoinCode(code));
            }
        }
        Err(RoomError::JoinCodesExhausted)
    }

    /// `createRoom` (spec.md §4.3): the first client of a fresh coordinator
    /// becomes host.
    pub fn create_room(
        &mut self,
        host_device_id: DeviceId,
        host_client_id: ClientId,
        host_name: String,
    ) -> Result<Room, RoomError> {
        let room_id = fresh_room_id();
        let join_code = self.allocate_join_code()?;
        let join_order = self.take_join_order();

        let host_member = Member {
            device_id: host_device_id.clone(),
            client_id: host_client_id,
            name: host_name,
            join_order,
            role: Role::Host,
        };

        let room = Room {
            room_id: room_id.clone(),
            join_code: join_code.clone(),
            host_device_id,
            members: vec![host_member],
            chat: VecDeque::new(),
            game_state: None,
        };

        self.join_codes.insert(join_code.0.clone(), room_id.clone());
        self.rooms.insert(room_id.0.clone(), room.clone());
        Ok(room)
    }

    /// `joinRoomByCode` (spec.md §4.3).
    pub fn join_room_by_code(
        &mut self,
        code: &JoinCode,
        device_id: DeviceId,
        client_id: ClientId,
        name: String,
    ) -> Result<Room, RoomError> {
        let room_id = self
            .join_codes
            .get(&code.0)
            .cloned()
            .ok_or(RoomError::InvalidJoinCode)?;
        let join_order = self.take_join_order();
        let room = self
            .rooms
            .get_mut(&room_id.0)
            .ok_or(RoomError::InvalidJoinCode)?;

        if room.members.iter().any(|m| m.name == name) {
            return Err(RoomError::NameConflict);
        }

        room.members.push(Member {
            device_id,
            client_id,
            name,
            join_order,
            role: Role::Member,
        });
        Ok(room.clone())
    }

    /// `leaveRoom` (spec.md §4.3). Destroys the room if it becomes empty;
    /// runs election and promotes the winner if the leaver was host.
    pub fn leave_room(
        &mut self,
        room_id: &RoomId,
        device_id: &DeviceId,
    ) -> Result<Option<Room>, RoomError> {
        let room = self
            .rooms
            .get_mut(&room_id.0)
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;

        let was_host = &room.host_device_id == device_id;
        let before = room.members.len();
        room.members.retain(|m| &m.device_id != device_id);
        if room.members.len() == before {
            return Err(RoomError::NotInRoom);
        }

        if room.members.is_empty() {
            let code = room.join_code.0.clone();
            self.join_codes.remove(&code);
            self.rooms.remove(&room_id.0);
            return Ok(None);
        }

        if was_host {
            Self::promote_new_host(room);
        }

        Ok(Some(room.clone()))
    }

    /// `kick` (spec.md §4.3). Only the current host may kick; re-elects if
    /// the removed member was somehow host (defensive — kicking yourself is
    /// unusual but not forbidden by the spec).
    pub fn kick(
        &mut self,
        room_id: &RoomId,
        host_device_id: &DeviceId,
        target_device_id: &DeviceId,
    ) -> Result<Room, RoomError> {
        let room = self
            .rooms
            .get_mut(&room_id.0)
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;

        if &room.host_device_id != host_device_id {
            return Err(RoomError::NotHost);
        }

        let was_host = &room.host_device_id == target_device_id;
        let before = room.members.len();
        room.members.retain(|m| &m.device_id != target_device_id);
        if room.members.len() == before {
            return Err(RoomError::NotInRoom);
        }

        if was_host && !room.members.is_empty() {
            Self::promote_new_host(room);
        }

        Ok(room.clone())
    }

    fn promote_new_host(room: &mut Room) {
        let candidates = room.candidates();
        if let Some(winner) = elect(&candidates) {
            room.reassign_host(&winner);
        }
    }

    /// `appendChat` (spec.md §4.3). Stamps `fromName` from the sender's
    /// current name and evicts the oldest entry once the buffer exceeds
    /// `CHAT_CAPACITY`.
    pub fn append_chat(
        &mut self,
        room_id: &RoomId,
        from_device_id: &DeviceId,
        text: String,
    ) -> Result<ChatEntry, RoomError> {
        let room = self
            .rooms
            .get_mut(&room_id.0)
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;

        let from_name = room
            .member(from_device_id)
            .ok_or(RoomError::NotInRoom)?
            .name
            .clone();

        let entry = ChatEntry {
            from_device_id: from_device_id.clone(),
            from_name,
            text,
            timestamp: now_ms(),
        };

        room.chat.push_back(entry.clone());
        while room.chat.len() > CHAT_CAPACITY {
            room.chat.pop_front();
        }

        Ok(entry)
    }

    /// `makeSnapshot` (spec.md §4.3). Returns a deep copy; the caller cannot
    /// mutate internal registry state through it.
    pub fn make_snapshot(&self, room_id: &RoomId) -> Result<Snapshot, RoomError> {
        let room = self
            .rooms
            .get(&room_id.0)
            .cloned()
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;
        Ok(Snapshot::from_room(room))
    }

    /// Seeds the registry with a previously broadcast snapshot (spec.md
    /// §4.4 "Restore"). Existing `clientId`s are provisional and are
    /// overwritten the next time their device reconnects and sends HELLO —
    /// see [`RoomRegistry::rebind_client`].
    pub fn restore(&mut self, snapshot: Snapshot) {
        let room = snapshot.room;
        self.join_codes
            .insert(room.join_code.0.clone(), room.room_id.clone());
        let max_join_order = room.members.iter().map(|m| m.join_order).max();
        if let Some(max) = max_join_order {
            self.next_join_order = self.next_join_order.max(max + 1);
        }
        self.rooms.insert(room.room_id.0.clone(), room);
    }

    /// Finds the room (if any) where `device_id` already holds a member
    /// record — true after a restore, or when a peer reconnects before its
    /// old connection has been reaped — and rewrites that member's
    /// `clientId` to the one just assigned by accept/HELLO.
    pub fn rebind_client(&mut self, device_id: &DeviceId, new_client_id: ClientId) -> Option<RoomId> {
        for room in self.rooms.values_mut() {
            if let Some(member) = room.member_mut(device_id) {
                member.client_id = new_client_id;
                return Some(room.room_id.clone());
            }
        }
        None
    }

    pub fn room_id_for_device(&self, device_id: &DeviceId) -> Option<RoomId> {
        self.rooms
            .values()
            .find(|r| r.member(device_id).is_some())
            .map(|r| r.room_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(s: &str) -> DeviceId {
        DeviceId::from(s)
    }
    fn cli(s: &str) -> ClientId {
        ClientId::from(s)
    }

    #[test]
    fn create_room_makes_a_single_host() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        assert_eq!(room.members.len(), 1);
        assert_eq!(room.members[0].role, Role::Host);
        assert_eq!(room.host_device_id, dev("dev-a"));
        assert_eq!(room.join_code.0.len(), 6);
        assert!(room.join_code.0.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn join_appends_member_with_distinct_join_order() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let room = reg
            .join_room_by_code(&room.join_code, dev("dev-b"), cli("c2"), "Bob".into())
            .unwrap();
        assert_eq!(room.members.len(), 2);
        assert_eq!(room.members[1].role, Role::Member);
        assert_ne!(room.members[0].join_order, room.members[1].join_order);
    }

    #[test]
    fn join_with_unknown_code_fails() {
        let mut reg = RoomRegistry::new();
        let err = reg
            .join_room_by_code(&JoinCode::from("ZZZZZZ"), dev("dev-b"), cli("c2"), "Bob".into())
            .unwrap_err();
        assert_eq!(err, RoomError::InvalidJoinCode);
    }

    #[test]
    fn duplicate_name_is_rejected_and_room_unchanged() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let err = reg
            .join_room_by_code(&room.join_code, dev("dev-c"), cli("c3"), "Alice".into())
            .unwrap_err();
        assert_eq!(err, RoomError::NameConflict);
        let room_after = reg.get(&room.room_id).unwrap();
        assert_eq!(room_after.members.len(), 1);
    }

    #[test]
    fn leave_destroys_room_when_empty() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let result = reg.leave_room(&room.room_id, &dev("dev-a")).unwrap();
        assert!(result.is_none());
        assert!(reg.get(&room.room_id).is_none());
        // the join code is released and can be reused
        let room2 = reg
            .create_room(dev("dev-z"), cli("c9"), "Zed".into())
            .unwrap();
        assert_ne!(room2.room_id, room.room_id);
    }

    #[test]
    fn leave_by_host_elects_new_host() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let room = reg
            .join_room_by_code(&room.join_code, dev("dev-b"), cli("c2"), "Bob".into())
            .unwrap();
        let room = reg.leave_room(&room.room_id, &dev("dev-a")).unwrap().unwrap();
        assert_eq!(room.host_device_id, dev("dev-b"));
        assert_eq!(room.members.len(), 1);
        assert_eq!(room.members[0].role, Role::Host);
    }

    #[test]
    fn kick_requires_host() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let room = reg
            .join_room_by_code(&room.join_code, dev("dev-b"), cli("c2"), "Bob".into())
            .unwrap();
        let err = reg
            .kick(&room.room_id, &dev("dev-b"), &dev("dev-a"))
            .unwrap_err();
        assert_eq!(err, RoomError::NotHost);
    }

    #[test]
    fn kick_removes_target() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let room = reg
            .join_room_by_code(&room.join_code, dev("dev-b"), cli("c2"), "Bob".into())
            .unwrap();
        let room = reg.kick(&room.room_id, &dev("dev-a"), &dev("dev-b")).unwrap();
        assert_eq!(room.members.len(), 1);
        assert!(room.member(&dev("dev-b")).is_none());
    }

    #[test]
    fn chat_from_non_member_fails() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let err = reg
            .append_chat(&room.room_id, &dev("dev-x"), "hi".into())
            .unwrap_err();
        assert_eq!(err, RoomError::NotInRoom);
    }

    #[test]
    fn chat_buffer_evicts_oldest_past_capacity() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        for i in 0..CHAT_CAPACITY {
            reg.append_chat(&room.room_id, &dev("dev-a"), format!("msg-{i}"))
                .unwrap();
        }
        let snap = reg.make_snapshot(&room.room_id).unwrap();
        assert_eq!(snap.room.chat.len(), CHAT_CAPACITY);
        assert_eq!(snap.room.chat.front().unwrap().text, "msg-0");

        reg.append_chat(&room.room_id, &dev("dev-a"), "msg-overflow".into())
            .unwrap();
        let snap = reg.make_snapshot(&room.room_id).unwrap();
        assert_eq!(snap.room.chat.len(), CHAT_CAPACITY);
        assert_eq!(snap.room.chat.front().unwrap().text, "msg-1");
        assert_eq!(snap.room.chat.back().unwrap().text, "msg-overflow");
    }

    #[test]
    fn snapshot_lookup_tables_mirror_members() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let snap = reg.make_snapshot(&room.room_id).unwrap();
        assert_eq!(snap.device_to_client.get("dev-a"), Some(&cli("c1")));
        assert_eq!(snap.device_to_name.get("dev-a"), Some(&"Alice".to_string()));
    }

    #[test]
    fn restore_then_snapshot_is_structurally_equal() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        reg.join_room_by_code(&room.join_code, dev("dev-b"), cli("c2"), "Bob".into())
            .unwrap();
        reg.append_chat(&room.room_id, &dev("dev-a"), "hi".into())
            .unwrap();
        let snap = reg.make_snapshot(&room.room_id).unwrap();

        let mut reg2 = RoomRegistry::new();
        reg2.restore(snap.clone());
        let snap2 = reg2.make_snapshot(&room.room_id).unwrap();

        assert_eq!(snap.room.members, snap2.room.members);
        assert_eq!(snap.room.chat, snap2.room.chat);
        assert_eq!(snap.device_to_client, snap2.device_to_client);
        assert_eq!(snap.device_to_name, snap2.device_to_name);
    }

    #[test]
    fn rebind_client_updates_member_without_changing_join_order() {
        let mut reg = RoomRegistry::new();
        let room = reg
            .create_room(dev("dev-a"), cli("c1"), "Alice".into())
            .unwrap();
        let original_order = room.members[0].join_order;

        let found = reg.rebind_client(&dev("dev-a"), cli("c-new"));
        assert_eq!(found, Some(room.room_id.clone()));

        let updated = reg.get(&room.room_id).unwrap();
        assert_eq!(updated.members[0].client_id, cli("c-new"));
        assert_eq!(updated.members[0].join_order, original_order);
    }

    #[test]
    fn join_codes_are_unique_across_many_rooms() {
        let mut reg = RoomRegistry::new();
        let mut codes = std::collections::HashSet::new();
        for i in 0..50 {
            let room = reg
                .create_room(dev(&format!("dev-{i}")), cli(&format!("c-{i}")), format!("P{i}"))
                .unwrap();
            assert!(codes.insert(room.join_code.0.clone()));
        }
    }
}
