//! Routing hash
//!
//! Document placement hashes the routing key with 32-bit Murmur3 (seed 0)
//! over the UTF-16LE code units of the key. Every node must produce
//! bit-identical values or documents become unreachable, so the reference
//! vector in the tests below is normative.

use std::io::Cursor;

/// Hash a routing key. Signed to match floor-mod arithmetic at call sites.
pub fn hash_routing(key: &str) -> i32 {
    let mut bytes = Vec::with_capacity(key.len() * 2);
    for unit in key.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    // reading from an in-memory cursor cannot fail
    murmur3::murmur3_32(&mut Cursor::new(bytes), 0)
        .map(|h| h as i32)
        .unwrap_or(0)
}

/// Floored modulo: result carries the sign of the divisor, matching the
/// arithmetic the shard formula is defined in.
pub fn floor_mod(value: i32, modulus: i32) -> i32 {
    value.rem_euclid(modulus)
}
