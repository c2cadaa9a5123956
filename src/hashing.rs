//! Deterministic digests used for ordering and idempotency.
//!
//! Both `order_key` and `idempotency_key` are pure functions of their inputs:
//! same bytes in, same digest out, on every machine and every run. Neither
//! touches the clock or any source of entropy.

use sha2::{Digest, Sha256};

use crate::types::{NodeId, OrderKey};

/// `H(parent_path ‖ node_id ‖ edge_index)`, truncated to the low 128 bits of
/// a SHA-256 digest (big-endian). `parent_path` is the dot-joined chain of
/// node ids from the start node down to (but not including) `node_id`, so
/// repeated visits to the same node via a cycle still receive distinct keys
/// (§9, "cycles and backpressure").
pub fn order_key(parent_path: &[NodeId], node_id: &NodeId, edge_index: u32) -> OrderKey {
    let mut hasher = Sha256::new();
    for segment in parent_path {
        hasher.update(segment.as_str().as_bytes());
        hasher.update([0u8]); // separator; node ids cannot contain NUL
    }
    hasher.update(node_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(edge_index.to_be_bytes());
    let digest = hasher.finalize();
    let low_bytes: [u8; 16] = digest[16..32]
        .try_into()
        .expect("sha256 digest is 32 bytes");
    OrderKey(u128::from_be_bytes(low_bytes))
}

/// Digest of `(run_id, step_id, sorted(order_keys), hash(prev_state))`.
/// Rejecting a commit that repeats a previously observed key is the engine's
/// crash-retry dedupe mechanism (§4.4, §8 invariant 4).
pub fn idempotency_key(
    run_id: &str,
    step_id: u64,
    mut order_keys: Vec<OrderKey>,
    prev_state_hash: &[u8],
) -> String {
    order_keys.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(step_id.to_be_bytes());
    for key in &order_keys {
        hasher.update(key.0.to_be_bytes());
    }
    hasher.update(prev_state_hash);
    let digest = hasher.finalize();
    hex_string(&digest)
}

/// Stable content hash of any serializable value, used both to feed
/// [`idempotency_key`] and to verify recorded-IO response bytes during
/// replay (§4.4 "recorded IO discipline").
pub fn content_hash<T: serde::Serialize>(value: &T) -> Result<[u8; 32], serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(&mut out, "{byte:02x}").expect("writing to String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_key_is_deterministic() {
        let path = vec![NodeId::Start, NodeId::custom("a")];
        let k1 = order_key(&path, &NodeId::custom("b"), 0);
        let k2 = order_key(&path, &NodeId::custom("b"), 0);
        assert_eq!(k1, k2);
    }

    #[test]
    fn order_key_distinguishes_edge_index() {
        let path = vec![NodeId::Start];
        let k0 = order_key(&path, &NodeId::custom("x"), 0);
        let k1 = order_key(&path, &NodeId::custom("x"), 1);
        assert_ne!(k0, k1);
    }

    #[test]
    fn order_key_distinguishes_repeated_visits_via_parent_path() {
        // A cycle revisiting node "router" through a longer path must not
        // collide with the first visit's order_key.
        let first_visit = vec![NodeId::Start];
        let second_visit = vec![NodeId::Start, NodeId::custom("router"), NodeId::custom("b")];
        let k1 = order_key(&first_visit, &NodeId::custom("router"), 0);
        let k2 = order_key(&second_visit, &NodeId::custom("router"), 0);
        assert_ne!(k1, k2);
    }

    #[test]
    fn idempotency_key_is_order_independent_in_input_vec() {
        let a = vec![OrderKey(3), OrderKey(1), OrderKey(2)];
        let b = vec![OrderKey(2), OrderKey(3), OrderKey(1)];
        let h = [0u8; 32];
        assert_eq!(
            idempotency_key("r1", 0, a, &h),
            idempotency_key("r1", 0, b, &h)
        );
    }

    #[test]
    fn idempotency_key_differs_on_step() {
        let h = [0u8; 32];
        let k0 = idempotency_key("r1", 0, vec![OrderKey(1)], &h);
        let k1 = idempotency_key("r1", 1, vec![OrderKey(1)], &h);
        assert_ne!(k0, k1);
    }
}
