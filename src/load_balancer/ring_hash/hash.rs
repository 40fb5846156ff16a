//! Stable 64-bit hash functions for ring keys.
//!
//! Both functions depend only on the input bytes, so rings built on
//! different machines or by different builds agree.

use crate::config::schema::HashFunction;

/// Seed used by MurmurHash64A ring keys.
pub const MURMUR_STD_HASH_SEED: u64 = 0xc70f_6907;

const MURMUR_MUL: u64 = 0xc6a4_a793_5bd1_e995;

pub fn xx_hash64(key: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(key, 0)
}

#[inline]
fn shift_mix(v: u64) -> u64 {
    v ^ (v >> 47)
}

/// MurmurHash64A over little-endian 8-byte words.
pub fn murmur_hash2_64(key: &[u8], seed: u64) -> u64 {
    let len = key.len() as u64;
    let mut hash = seed ^ len.wrapping_mul(MURMUR_MUL);

    let mut chunks = key.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let data = shift_mix(u64::from_le_bytes(word).wrapping_mul(MURMUR_MUL))
            .wrapping_mul(MURMUR_MUL);
        hash ^= data;
        hash = hash.wrapping_mul(MURMUR_MUL);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let data = tail
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        hash ^= data;
        hash = hash.wrapping_mul(MURMUR_MUL);
    }

    hash = shift_mix(hash).wrapping_mul(MURMUR_MUL);
    shift_mix(hash)
}

/// Hash a ring key with the configured function.
pub fn hash_key(function: HashFunction, key: &[u8]) -> u64 {
    match function {
        HashFunction::XxHash => xx_hash64(key),
        HashFunction::MurmurHash2 => murmur_hash2_64(key, MURMUR_STD_HASH_SEED),
    }
}
