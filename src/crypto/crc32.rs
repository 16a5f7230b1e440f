// src/crypto/crc32.rs

//! CRC32 internal-state arithmetic
//!
//! The standard CRC32 (ISO 3309, reflected polynomial 0xEDB88320) as the
//! machine computes it, exposed at the *internal state* level: the running
//! register before the final bit-flip. Forgery needs to step that state
//! forward, step it backward one byte at a time, and walk a whole suffix
//! in reverse, none of which a checksum crate exposes.

/// Reflected CRC32 generator polynomial
const POLY: u32 = 0xEDB8_8320;

/// Initial internal state (all ones)
pub const INIT: u32 = 0xFFFF_FFFF;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Maps the top byte of a table entry back to its index. The top bytes of
/// the 256 entries are a permutation of 0..=255, which is what makes the
/// byte-wise step reversible.
const fn build_reverse_table(table: &[u32; 256]) -> [u8; 256] {
    let mut rev = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        rev[(table[i] >> 24) as usize] = i as u8;
        i += 1;
    }
    rev
}

const TABLE: [u32; 256] = build_table();
const REVERSE: [u8; 256] = build_reverse_table(&TABLE);

/// Advance the internal state over a buffer
#[inline]
pub fn update(mut state: u32, data: &[u8]) -> u32 {
    for &byte in data {
        state = TABLE[((state ^ byte as u32) & 0xFF) as usize] ^ (state >> 8);
    }
    state
}

/// Final checksum from an internal state
#[inline]
pub fn finalize(state: u32) -> u32 {
    state ^ 0xFFFF_FFFF
}

/// Checksum of a whole buffer
#[inline]
pub fn checksum(data: &[u8]) -> u32 {
    finalize(update(INIT, data))
}

/// Undo one byte step: given the state *after* processing `byte`, recover
/// the state before it
#[inline]
pub fn unstep(state_after: u32, byte: u8) -> u32 {
    let idx = REVERSE[(state_after >> 24) as usize];
    ((state_after ^ TABLE[idx as usize]) << 8) | (idx ^ byte) as u32
}

/// Walk a suffix backwards: given the state after `state ‖ suffix`, recover
/// the state just before the suffix
pub fn reverse(mut state_after: u32, suffix: &[u8]) -> u32 {
    for &byte in suffix.iter().rev() {
        state_after = unstep(state_after, byte);
    }
    state_after
}
