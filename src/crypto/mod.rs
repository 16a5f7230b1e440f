// src/crypto/mod.rs

//! Keystream cipher and CRC32 forgery
//!
//! Everything in here is pure and reentrant; callers parallelize freely
//! across assets.

pub mod crc32;
pub mod forge;
pub mod keystream;

pub use forge::{append_forge, interior_forge};
pub use keystream::{KeystreamProvider, KeystreamSession, ListToken, SessionExtractor};
