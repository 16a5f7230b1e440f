// src/crypto/forge.rs

//! CRC32 forgery: choose 4 bytes so a buffer checksums to a chosen value
//!
//! The CRC of a buffer is an affine function (over GF(2)) of any 4-byte
//! window in it. Given the internal state entering the window and the
//! state that must leave it, the window bytes are the solution of a
//! 32-unknown linear system, solved here by Gaussian elimination. The
//! system is always solvable because the byte step is bijective; a
//! singular system means the tables are corrupt, which is an invariant
//! violation and never retried.
//!
//! Two entry points: [`append_forge`] picks a 4-byte suffix (the machine's
//! trailing checksum window), [`interior_forge`] patches 4 bytes in the
//! middle of a buffer, accounting for everything after the window by
//! walking it in reverse. Both verify their work with an independent
//! checksum implementation before returning.

use crate::crypto::crc32;
use crate::error::{Error, Result};

/// Advance the internal state over a 4-byte window given as a
/// little-endian word
#[inline]
fn step_window(state: u32, window: u32) -> u32 {
    crc32::update(state, &window.to_le_bytes())
}

/// Solve for the window bytes that take `start_state` to `target_state`
pub fn forge_window(start_state: u32, target_state: u32) -> Result<[u8; 4]> {
    // Affine decomposition: f(b) = f(0) ^ L(b) with L linear in the
    // window bits. Solve L(b) = target ^ f(0).
    let zero_image = step_window(start_state, 0);
    let mut columns = [0u32; 32];
    for (bit, column) in columns.iter_mut().enumerate() {
        *column = step_window(start_state, 1u32 << bit) ^ zero_image;
    }
    let rhs_word = target_state ^ zero_image;

    // Row r: sum over unknowns i of bit r of columns[i], equals bit r of rhs.
    let mut rows = [0u32; 32];
    let mut rhs = [0u8; 32];
    for r in 0..32 {
        let mut coeffs = 0u32;
        for (i, column) in columns.iter().enumerate() {
            coeffs |= ((column >> r) & 1) << i;
        }
        rows[r] = coeffs;
        rhs[r] = ((rhs_word >> r) & 1) as u8;
    }

    // Gauss-Jordan over GF(2)
    let mut pivot_of = [usize::MAX; 32];
    let mut used = [false; 32];
    for col in 0..32 {
        let Some(pivot) = (0..32).find(|&r| !used[r] && rows[r] & (1 << col) != 0) else {
            continue;
        };
        used[pivot] = true;
        pivot_of[col] = pivot;
        for r in 0..32 {
            if r != pivot && rows[r] & (1 << col) != 0 {
                rows[r] ^= rows[pivot];
                rhs[r] ^= rhs[pivot];
            }
        }
    }

    let mut solution = 0u32;
    for col in 0..32 {
        let pivot = pivot_of[col];
        if pivot == usize::MAX {
            return Err(Error::InvariantViolation(
                "singular system while forging checksum window".to_string(),
            ));
        }
        solution |= (rhs[pivot] as u32) << col;
    }

    Ok(solution.to_le_bytes())
}

/// Choose a 4-byte suffix so `crc32(data ‖ suffix) == target_crc`
pub fn append_forge(data: &[u8], target_crc: u32) -> Result<[u8; 4]> {
    let entry_state = crc32::update(crc32::INIT, data);
    let exit_state = target_crc ^ 0xFFFF_FFFF;
    let suffix = forge_window(entry_state, exit_state)?;

    let check = crc32fast::hash(&[data, &suffix].concat());
    if check != target_crc {
        return Err(Error::Integrity(format!(
            "forged suffix verification failed: got {:#010x}, wanted {:#010x}",
            check, target_crc
        )));
    }
    Ok(suffix)
}

/// Patch the 4 bytes at `offset` so the whole buffer checksums to
/// `target_crc`; bytes outside the window are untouched
///
/// A window ending at the buffer's last byte behaves exactly like
/// [`append_forge`] of the preceding content.
pub fn interior_forge(buf: &mut [u8], offset: usize, target_crc: u32) -> Result<()> {
    let end = offset.checked_add(4).ok_or_else(|| {
        Error::InvariantViolation(format!("forge window offset {} overflows", offset))
    })?;
    if end > buf.len() {
        return Err(Error::InvariantViolation(format!(
            "forge window [{}, {}) exceeds buffer of {} bytes",
            offset,
            end,
            buf.len()
        )));
    }

    let entry_state = crc32::update(crc32::INIT, &buf[..offset]);
    let final_state = target_crc ^ 0xFFFF_FFFF;
    let exit_state = crc32::reverse(final_state, &buf[end..]);

    let window = forge_window(entry_state, exit_state)?;
    buf[offset..end].copy_from_slice(&window);

    let check = crc32fast::hash(buf);
    if check != target_crc {
        return Err(Error::Integrity(format!(
            "forged window verification failed: got {:#010x}, wanted {:#010x}",
            check, target_crc
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn append_hits_arbitrary_targets() {
        let mut rng = StdRng::seed_from_u64(10);
        for _ in 0..50 {
            let len = rng.gen_range(0..256);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let target: u32 = rng.gen();

            let suffix = append_forge(&data, target).unwrap();
            let mut forged = data.clone();
            forged.extend_from_slice(&suffix);
            assert_eq!(crc32fast::hash(&forged), target);
        }
    }

    #[test]
    fn append_empty_data() {
        let suffix = append_forge(&[], 0xDEAD_BEEF).unwrap();
        assert_eq!(crc32fast::hash(&suffix), 0xDEAD_BEEF);
    }

    #[test]
    fn interior_hits_target_and_preserves_rest() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let len = rng.gen_range(4..512);
            let mut buf: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let offset = rng.gen_range(0..=len - 4);
            let target: u32 = rng.gen();

            let before = buf.clone();
            interior_forge(&mut buf, offset, target).unwrap();

            assert_eq!(crc32fast::hash(&buf), target);
            assert_eq!(&buf[..offset], &before[..offset]);
            assert_eq!(&buf[offset + 4..], &before[offset + 4..]);
        }
    }

    #[test]
    fn interior_at_end_matches_append() {
        let data = b"the quick brown fox".to_vec();
        let target = 0x1234_5678;

        let suffix = append_forge(&data, target).unwrap();

        let mut buf = data.clone();
        buf.extend_from_slice(&[0, 0, 0, 0]);
        interior_forge(&mut buf, data.len(), target).unwrap();

        assert_eq!(&buf[data.len()..], &suffix);
    }

    #[test]
    fn interior_rejects_short_window() {
        let mut buf = vec![0u8; 3];
        assert!(matches!(
            interior_forge(&mut buf, 0, 0),
            Err(Error::InvariantViolation(_))
        ));

        let mut buf = vec![0u8; 10];
        assert!(matches!(
            interior_forge(&mut buf, 8, 0),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn forge_window_roundtrip() {
        let mut rng = StdRng::seed_from_u64(12);
        for _ in 0..100 {
            let start: u32 = rng.gen();
            let target: u32 = rng.gen();
            let window = forge_window(start, target).unwrap();
            assert_eq!(crc32::update(start, &window), target);
        }
    }
}
