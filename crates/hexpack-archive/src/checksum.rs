//! SHA-256 helpers shared by the archive codec.

use sha2::{Digest, Sha256};

/// Digest width in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// SHA-256 over the concatenation of several byte slices.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}
