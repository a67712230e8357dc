//! Deterministic host election (spec.md §4.3, §9).
//!
//! Total order: `(joinOrder ascending, deterministicHash(deviceId) ascending)`.
//! The hash only breaks ties between equal `joinOrder`s (which shouldn't
//! happen within one room, but a stable tiebreaker makes the order total
//! rather than merely partial); every peer must compute the same value, so
//! it is a small hand-rolled FNV-1a rather than `std::collections::hash_map`'s
//! `DefaultHasher`, whose algorithm is explicitly not guaranteed stable
//! across compiler versions.

use crate::ids::DeviceId;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Deterministic, stable-across-builds hash of a device id's UTF-8 bytes.
pub fn deterministic_hash(device_id: &DeviceId) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in device_id.as_str().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// One election candidate: enough of a `Member` to order it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub device_id: DeviceId,
    pub join_order: u64,
}

/// Elects the new host from a candidate list. Returns `None` if `candidates`
/// is empty (the caller destroys the room instead of electing).
///
/// Per spec.md §9's resolved Open Question, the caller is responsible for
/// pruning a known-dead host from `candidates` before calling this — this
/// function just applies the total order to whatever it is given.
pub fn elect(candidates: &[Candidate]) -> Option<DeviceId> {
    candidates
        .iter()
        .min_by_key(|c| (c.join_order, deterministic_hash(&c.device_id)))
        .map(|c| c.device_id.clone())
}
