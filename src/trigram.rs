//! Trigram fingerprints for the field-hints index
//!
//! Every field value stored on a leaf is cut into overlapping 3-byte
//! windows and each window is hashed with 64-bit FNV-1a. A leaf that holds
//! a value containing literal `L` necessarily advertised every trigram of
//! `L`, which is what makes hint lookups sound.

use std::collections::BTreeSet;

/// 64-bit trigram hash
pub type Fingerprint = u64;

/// Shortest literal that yields at least one trigram
pub const TRIGRAM_LEN: usize = 3;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over arbitrary bytes
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Fingerprints of every 3-byte window of `text`
///
/// Returns an empty set for text shorter than three bytes.
pub fn trigrams(text: &str) -> BTreeSet<Fingerprint> {
    text.as_bytes().windows(TRIGRAM_LEN).map(fnv1a).collect()
}
