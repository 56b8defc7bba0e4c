//! Deterministic ID generation via BLAKE3
//!
//! Producers derive ids from semantic keys, so re-analyzing an unchanged
//! file yields the same ids and the store can diff by identity.

use blake3::Hasher;

/// First 16 bytes of the hash, little-endian.
fn hash_to_u128(hash: &blake3::Hash) -> u128 {
    let mut head = [0u8; 16];
    head.copy_from_slice(&hash.as_bytes()[0..16]);
    u128::from_le_bytes(head)
}

/// Convert string ID to u128
///
/// Used to convert IDs like "SERVICE:name" or "MODULE:hash" to u128
///
/// # Examples
/// ```
/// use cgstore::graph::string_id_to_u128;
///
/// let id = string_id_to_u128("SERVICE:my-service");
/// assert_ne!(id, 0);
/// ```
pub fn string_id_to_u128(id: &str) -> u128 {
    let mut hasher = Hasher::new();
    hasher.update(id.as_bytes());
    hash_to_u128(&hasher.finalize())
}

/// Compute deterministic node ID
///
/// ID = BLAKE3(kind|name|scope|path) -> u128 (first 16 bytes)
///
/// # Examples
/// ```
/// use cgstore::graph::compute_node_id;
///
/// let id = compute_node_id("FUNCTION", "getUserById", "MODULE:users.js", "src/api/users.js");
/// assert_ne!(id, 0);
/// ```
pub fn compute_node_id(kind: &str, name: &str, scope: &str, path: &str) -> u128 {
    let mut hasher = Hasher::new();

    // компоненты через разделитель, чтобы "a|bc" != "ab|c"
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(scope.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());

    hash_to_u128(&hasher.finalize())
}

/// Scalar identity of an edge, for callers that key maps or caches on
/// edges. The store itself deduplicates on `(src, dst, kind)`.
pub fn compute_edge_key(src: u128, dst: u128, kind: &str) -> u128 {
    let mut hasher = Hasher::new();
    hasher.update(&src.to_le_bytes());
    hasher.update(&dst.to_le_bytes());
    hasher.update(kind.as_bytes());
    hash_to_u128(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_id() {
        let id1 = compute_node_id("FUNCTION", "getUserById", "MODULE:users.js", "src/api/users.js");
        let id2 = compute_node_id("FUNCTION", "getUserById", "MODULE:users.js", "src/api/users.js");
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_different_kinds_different_ids() {
        let id1 = compute_node_id("FUNCTION", "handler", "MODULE:api.js", "src/api.js");
        let id2 = compute_node_id("http:route", "handler", "MODULE:api.js", "src/api.js");
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_separator_prevents_shifted_collisions() {
        let id1 = compute_node_id("FUNCTION", "ab", "c", "f.js");
        let id2 = compute_node_id("FUNCTION", "a", "bc", "f.js");
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_edge_key_depends_on_direction_and_kind() {
        let calls = compute_edge_key(1, 2, "CALLS");
        assert_eq!(calls, compute_edge_key(1, 2, "CALLS"));
        assert_ne!(calls, compute_edge_key(2, 1, "CALLS"));
        assert_ne!(calls, compute_edge_key(1, 2, "USES"));
    }

    #[test]
    fn test_string_id_to_u128() {
        let id1 = string_id_to_u128("SERVICE:my-service");
        assert_eq!(id1, string_id_to_u128("SERVICE:my-service"));
        assert_ne!(id1, string_id_to_u128("SERVICE:other-service"));
    }
}
