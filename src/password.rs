//! Account password digests.
//!
//! The on-disk format is the lowercase hex SHA-256 of the UTF-8 password with
//! no salt and no stretching. It is kept so existing `password.txt` files stay
//! valid; see DESIGN.md for the weakness this carries.

use sha2::{Digest, Sha256};

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Re-hash `password` and compare with the stored digest.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let computed = hash_password(password);
    let stored = stored.trim();
    // Compare without exiting early on the first differing byte.
    computed.len() == stored.len()
        && computed
            .bytes()
            .zip(stored.bytes().map(|b| b.to_ascii_lowercase()))
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
