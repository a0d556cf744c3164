//! The two locale keystreams.
//!
//! Every string in an archive is XOR-encrypted against one of two 65 536-byte
//! pads, expanded from the shared AES user key with a per-locale IV. The pads
//! never change at runtime, so they live in process-wide [`LazyLock`]s and
//! everything downstream holds `&'static` references into them.

use std::sync::LazyLock;

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;

pub const KEY_LEN: usize = 0x10000;

/// Only every fourth byte of the user key is meaningful.
const USER_KEY: [u8; 32] = [
    0x13, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0xB4, 0x00, 0x00,
    0x00, 0x1B, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x33, 0x00, 0x00, 0x00, 0x52, 0x00,
    0x00, 0x00,
];

const GMS_IV: [u8; 4] = [0x4D, 0x23, 0xC7, 0x2B];
const KMS_IV: [u8; 4] = [0xB9, 0x7D, 0x63, 0xE9];

pub static GMS_KEY: LazyLock<Box<[u8; KEY_LEN]>> = LazyLock::new(|| expand_key(GMS_IV));
pub static KMS_KEY: LazyLock<Box<[u8; KEY_LEN]>> = LazyLock::new(|| expand_key(KMS_IV));

/// Candidate keys for locale deduction, in deduction order.
pub fn candidates() -> [&'static [u8; KEY_LEN]; 2] {
    [&GMS_KEY, &KMS_KEY]
}

/// Generates a keystream: the first block is the IV repeated four times and
/// AES-256-ECB encrypted; each following block encrypts the previous one.
fn expand_key(iv: [u8; 4]) -> Box<[u8; KEY_LEN]> {
    let cipher = Aes256::new(&USER_KEY.into());
    let mut key = vec![0u8; KEY_LEN].into_boxed_slice();
    let mut block = [0u8; 16];
    for (chunk, seed) in block.chunks_exact_mut(4).zip(std::iter::repeat(iv)) {
        chunk.copy_from_slice(&seed);
    }
    for out in key.chunks_exact_mut(16) {
        let mut b = block.into();
        cipher.encrypt_block(&mut b);
        block.copy_from_slice(&b);
        out.copy_from_slice(&block);
    }
    key.try_into().expect("keystream length is fixed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystreams_are_full_length_and_distinct() {
        assert_eq!(GMS_KEY.len(), KEY_LEN);
        assert_eq!(KMS_KEY.len(), KEY_LEN);
        assert_ne!(GMS_KEY[..64], KMS_KEY[..64]);
    }

    #[test]
    fn keystream_is_deterministic() {
        let again = expand_key(GMS_IV);
        assert_eq!(GMS_KEY[..], again[..]);
    }

    #[test]
    fn xor_is_an_involution() {
        let plain = b"Character.wz probe";
        let mask = |i: usize| 0xAAu8.wrapping_add(i as u8);
        let cipher: Vec<u8> = plain
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ GMS_KEY[i] ^ mask(i))
            .collect();
        let back: Vec<u8> = cipher
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ GMS_KEY[i] ^ mask(i))
            .collect();
        assert_eq!(&back, plain);
    }
}
