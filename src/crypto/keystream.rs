// src/crypto/keystream.rs

//! Path-keyed XOR keystream application
//!
//! The keystream itself comes from the vendor's licensing library through
//! the [`KeystreamProvider`] capability; this module only applies it.
//! Each file gets its own stream, seeded from the file's absolute path.
//! The stream is consumed as little-endian 64-bit words, one per 8-byte
//! block; a partial final block uses the leading bytes of the next word.
//! XOR is its own inverse, so the same routine encrypts and decrypts.

use rand::RngCore;

use crate::error::{Error, Result};

/// A per-file keystream, already seeded for one path
pub trait KeystreamSession {
    /// Next 64 keystream bits
    fn next64(&mut self) -> u64;
}

/// Capability handed in by the caller; internals are opaque
pub trait KeystreamProvider: Send + Sync {
    /// Seed a fresh stream for the given absolute asset path
    fn seed(&self, path: &str) -> Box<dyn KeystreamSession + '_>;
}

/// Opaque token captured from a live session, sufficient to re-encrypt a
/// list-sized buffer later without the hardware present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListToken(pub Vec<u8>);

/// Capability to capture a [`ListToken`] from the current session
pub trait SessionExtractor: Send + Sync {
    fn extract(&self) -> Result<ListToken>;
}

/// XOR a buffer with the keystream for `path`, in place
pub fn apply_in_place(provider: &dyn KeystreamProvider, path: &str, buf: &mut [u8]) {
    let mut session = provider.seed(path);
    for block in buf.chunks_mut(8) {
        let word = session.next64().to_le_bytes();
        for (byte, key) in block.iter_mut().zip(word.iter()) {
            *byte ^= key;
        }
    }
}

/// XOR a buffer with the keystream for `path`, returning a new buffer
pub fn apply(provider: &dyn KeystreamProvider, path: &str, data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_in_place(provider, path, &mut out);
    out
}

/// Decrypt an asset: apply the keystream, then drop the filler prefix
pub fn decrypt_asset(
    provider: &dyn KeystreamProvider,
    path: &str,
    encrypted: &[u8],
    filler_size: u32,
) -> Result<Vec<u8>> {
    let filler = filler_size as usize;
    if filler > encrypted.len() {
        return Err(Error::Format(format!(
            "{}: filler {} exceeds file of {} bytes",
            path,
            filler,
            encrypted.len()
        )));
    }
    let mut buf = apply(provider, path, encrypted);
    buf.drain(..filler);
    Ok(buf)
}

/// Encrypt an asset: prepend `filler_size` random bytes, then apply the
/// keystream over the whole buffer
pub fn encrypt_asset(
    provider: &dyn KeystreamProvider,
    path: &str,
    plaintext: &[u8],
    filler_size: u32,
) -> Vec<u8> {
    let mut buf = vec![0u8; filler_size as usize];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.extend_from_slice(plaintext);
    apply_in_place(provider, path, &mut buf);
    buf
}

/// Provider backed by keystream material the decrypt hook dumps per
/// asset, named by the xxh3 of the asset path
///
/// The hook captures each stream with generous slack past the asset
/// length. Reads past the captured material yield zero words; the
/// pipeline verifies material against the original encrypted bytes
/// before trusting it, so truncated or missing dumps surface as
/// integrity errors instead of corrupt output.
pub struct CapturedKeystream {
    dir: std::path::PathBuf,
}

impl CapturedKeystream {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File name the hook uses for one asset's material
    pub fn material_name(path: &str) -> String {
        format!("{:016x}.ks", xxhash_rust::xxh3::xxh3_64(path.as_bytes()))
    }
}

struct CapturedSession {
    material: Vec<u8>,
    offset: usize,
}

impl KeystreamSession for CapturedSession {
    fn next64(&mut self) -> u64 {
        let mut word = [0u8; 8];
        let end = (self.offset + 8).min(self.material.len());
        if self.offset < end {
            word[..end - self.offset].copy_from_slice(&self.material[self.offset..end]);
        }
        self.offset += 8;
        u64::from_le_bytes(word)
    }
}

impl KeystreamProvider for CapturedKeystream {
    fn seed(&self, path: &str) -> Box<dyn KeystreamSession + '_> {
        let material = std::fs::read(self.dir.join(Self::material_name(path))).unwrap_or_default();
        Box::new(CapturedSession {
            material,
            offset: 0,
        })
    }
}

pub mod testing {
    //! Deterministic provider for tests: xxh3-mixed counter stream keyed
    //! by the path, stable across runs

    use super::{KeystreamProvider, KeystreamSession};
    use xxhash_rust::xxh3::xxh3_64;

    pub struct FixedKeystream;

    pub struct FixedSession {
        seed: u64,
        counter: u64,
    }

    impl KeystreamSession for FixedSession {
        fn next64(&mut self) -> u64 {
            self.counter += 1;
            xxh3_64(&[self.seed.to_le_bytes(), self.counter.to_le_bytes()].concat())
        }
    }

    impl KeystreamProvider for FixedKeystream {
        fn seed(&self, path: &str) -> Box<dyn KeystreamSession + '_> {
            Box::new(FixedSession {
                seed: xxh3_64(path.as_bytes()),
                counter: 0,
            })
        }
    }
}
