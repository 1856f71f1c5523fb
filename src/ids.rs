//! Object identifiers: 16 bytes from the OS random source, hex encoded.

use rand::{RngCore, rngs::OsRng};

pub const ID_BYTES: usize = 16;
pub const ID_LEN: usize = ID_BYTES * 2;

/// Generate a fresh 32-character lowercase hex identifier.
pub fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// True if `candidate` has the exact shape produced by [`generate_id`].
///
/// Checked before an id is used to build a path or hit the ledger.
pub fn is_valid_id(candidate: &str) -> bool {
    candidate.len() == ID_LEN
        && candidate
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
