// tests/forging.rs

//! CRC32 forgery properties over realistic asset shapes.

use jjpatch::crypto::keystream::testing::FixedKeystream;
use jjpatch::crypto::{append_forge, interior_forge, keystream};
use rand::{Rng, SeedableRng};

fn pseudo_asset(rng: &mut impl Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn append_forge_hits_arbitrary_targets() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for len in [0usize, 1, 3, 4, 100, 4096, 65_537] {
        let data = pseudo_asset(&mut rng, len);
        let target: u32 = rng.gen();

        let suffix = append_forge(&data, target).unwrap();
        let forged = [data.as_slice(), &suffix].concat();
        assert_eq!(crc32fast::hash(&forged), target);
    }
}

#[test]
fn interior_forge_touches_only_its_window() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    for (len, offset) in [(16usize, 0usize), (16, 12), (1024, 500), (1024, 1020)] {
        let original = pseudo_asset(&mut rng, len);
        let target: u32 = rng.gen();

        let mut buf = original.clone();
        interior_forge(&mut buf, offset, target).unwrap();

        assert_eq!(crc32fast::hash(&buf), target);
        assert_eq!(buf[..offset], original[..offset]);
        assert_eq!(buf[offset + 4..], original[offset + 4..]);
    }
}

#[test]
fn forged_suffix_survives_encryption_with_interior_fixup() {
    // The full trick the modify pipeline relies on: forge the decrypted
    // checksum with an appended suffix, encrypt, then forge the
    // encrypted checksum inside the filler. Both checksums must hold at
    // once.
    let provider = FixedKeystream;
    let path = "/jjpe/gen1/wonka/game/edata/music.bin";
    let filler = 16usize;

    let content = b"replacement content of a different length than before";
    let crc_decrypted: u32 = 0xDEAD_BEEF;
    let crc_encrypted: u32 = 0x1234_5678;

    let suffix = append_forge(content, crc_decrypted).unwrap();
    let mut buf = vec![0u8; filler];
    buf.extend_from_slice(content);
    buf.extend_from_slice(&suffix);
    keystream::apply_in_place(&provider, path, &mut buf);
    interior_forge(&mut buf, filler - 4, crc_encrypted).unwrap();

    assert_eq!(crc32fast::hash(&buf), crc_encrypted);

    let decrypted = keystream::apply(&provider, path, &buf);
    assert_eq!(crc32fast::hash(&decrypted[filler..]), crc_decrypted);
    assert_eq!(&decrypted[filler..filler + content.len()], content);
}

#[test]
fn window_too_close_to_end_is_rejected() {
    let mut buf = vec![0u8; 10];
    assert!(interior_forge(&mut buf, 8, 0xFFFF_FFFF).is_err());
    assert!(interior_forge(&mut buf, 6, 0xFFFF_FFFF).is_ok());
}
