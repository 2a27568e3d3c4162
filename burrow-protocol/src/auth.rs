//! Login challenge-response
//!
//! Both sides prove knowledge of the shared password without putting it on
//! the wire: the 32-byte password block is XORed word-wise with the
//! server-chosen seed and hashed. Raw-mode login shifts the seed by +1/-1 so
//! DNS and raw handshakes cannot be replayed against each other.

use md5::{Digest, Md5};

/// Hash length on the wire.
pub const LOGIN_HASH_LEN: usize = 16;

/// Compute the login hash for `seed`.
///
/// The password is zero-padded into a 32-byte block; each big-endian u32
/// word is XORed with the seed before the block is hashed with MD5.
pub fn login_hash(password: &[u8], seed: i32) -> [u8; LOGIN_HASH_LEN] {
    let mut block = [0u8; 32];
    let n = password.len().min(32);
    block[..n].copy_from_slice(&password[..n]);

    for word in block.chunks_exact_mut(4) {
        let v = u32::from_be_bytes([word[0], word[1], word[2], word[3]]) ^ seed as u32;
        word.copy_from_slice(&v.to_be_bytes());
    }

    let mut hasher = Md5::new();
    hasher.update(block);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_changes_hash() {
        let a = login_hash(b"secret", 1000);
        let b = login_hash(b"secret", 1001);
        assert_ne!(a, b);
    }

    #[test]
    fn test_password_changes_hash() {
        let a = login_hash(b"secret", 1000);
        let b = login_hash(b"secret2", 1000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(login_hash(b"pw", -7), login_hash(b"pw", -7));
    }

    #[test]
    fn test_long_password_truncated_at_block() {
        let long = [b'x'; 64];
        assert_eq!(login_hash(&long, 5), login_hash(&long[..32], 5));
    }

    #[test]
    fn test_raw_mode_seed_shift_differs() {
        let seed = 0x1234_5678i32;
        let dns = login_hash(b"pw", seed);
        let raw_in = login_hash(b"pw", seed.wrapping_add(1));
        let raw_out = login_hash(b"pw", seed.wrapping_sub(1));
        assert_ne!(dns, raw_in);
        assert_ne!(dns, raw_out);
        assert_ne!(raw_in, raw_out);
    }
}
