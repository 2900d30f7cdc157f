//! Field addressing hash
//!
//! Field names never travel on the wire; the device and the host both reduce
//! them to a 32-bit djb2 hash and exchange the number instead.

/// djb2 hash: `h = h * 33 + byte`, seeded with 5381, wrapping at 32 bits.
///
/// `const` so that well-known ids (such as the scene selector) can be
/// computed at compile time.
pub const fn hash_djb(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    let mut i = 0;
    while i < bytes.len() {
        hash = hash.wrapping_mul(33).wrapping_add(bytes[i] as u32);
        i += 1;
    }
    hash
}

/// Convenience wrapper for string field names
pub fn hash_name(name: &str) -> u32 {
    hash_djb(name.as_bytes())
}
