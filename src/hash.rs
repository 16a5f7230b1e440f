// src/hash.rs

//! Content hashing for change detection and cache fingerprints
//!
//! Two algorithms are supported:
//! - **XXH128**: fast non-cryptographic hash, the default for baseline
//!   entries and extraction-cache fingerprints, where only collision
//!   resistance against accidental change matters.
//! - **SHA-256**: kept for callers that want a cryptographic digest.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use xxhash_rust::xxh3::Xxh3;

use crate::error::{Error, Result};

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// XXH128 (128-bit, non-cryptographic, very fast)
    #[default]
    Xxh128,
    /// SHA-256 (256-bit, cryptographic)
    Sha256,
}

impl HashAlgorithm {
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Xxh128 => 16,
            Self::Sha256 => 32,
        }
    }

    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Xxh128 => "xxh128",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "xxh128" | "xxh3" | "xxhash" => Ok(Self::Xxh128),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(Error::Format(format!("unknown hash algorithm: {}", s))),
        }
    }
}

/// A hash value paired with its algorithm, stored as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl ContentHash {
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Result<Self> {
        let value: String = value.into();
        if value.len() != algorithm.hex_len() {
            return Err(Error::Format(format!(
                "invalid {} hash length: expected {}, got {}",
                algorithm,
                algorithm.hex_len(),
                value.len()
            )));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Format(format!("invalid hex in hash: {}", value)));
        }
        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    fn new_unchecked(algorithm: HashAlgorithm, value: String) -> Self {
        Self { algorithm, value }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Incremental hasher over either algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Xxh128(Xxh3),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Xxh3::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Xxh128(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> ContentHash {
        let value = match self.state {
            HasherState::Xxh128(h) => format!("{:032x}", h.digest128()),
            HasherState::Sha256(h) => format!("{:x}", h.finalize()),
        };
        ContentHash::new_unchecked(self.algorithm, value)
    }
}

/// Hash a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> ContentHash {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Hash everything a reader yields, in fixed-size chunks
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> Result<ContentHash> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Hash a file's content without loading it into memory
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<ContentHash> {
    let mut file = std::fs::File::open(path)?;
    hash_reader(algorithm, &mut file)
}
