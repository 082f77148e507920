//! Hashes arbitrary byte strings down to the 64-bit space the sketch
//! operates on. Any reasonable non-cryptographic 64-bit hash works
//! here; used by the `/add` endpoint, which takes a string value
//! rather than a raw hash.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// Hashes `value` to a 64-bit hash using xxHash64.
pub fn hash_str(value: &str) -> u64 {
    let mut hasher = XxHash64::default();
    hasher.write(value.as_bytes());
    hasher.finish()
}
