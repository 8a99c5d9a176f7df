//! Short join codes for relay-backed sessions.

use rand::Rng;

/// Digits and uppercase letters minus the lookalikes I, O and L. Codes are
/// read aloud and typed by hand when QR scanning fails.
pub const SID_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTUVWXYZ";

pub const SID_LEN: usize = 10;

pub fn generate_sid() -> String {
    let mut rng = rand::thread_rng();
    (0..SID_LEN)
        .map(|_| SID_ALPHABET[rng.gen_range(0..SID_ALPHABET.len())] as char)
        .collect()
}

pub fn is_valid_sid(value: &str) -> bool {
    value.len() == SID_LEN && value.bytes().all(|b| SID_ALPHABET.contains(&b))
}
