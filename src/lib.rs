// src/lib.rs

//! JJP Asset Patcher
//!
//! Decrypts and re-encrypts the binary assets of a Jersey Jack Pinball
//! machine inside its Clonezilla recovery image.
//!
//! # Architecture
//!
//! - Keystream as a capability: per-file XOR streams keyed by the asset
//!   path, handed in behind [`crypto::KeystreamProvider`]; vendor
//!   internals stay outside the crate
//! - Checksum forgery: replacement content is made to match both
//!   manifest CRC32 records exactly, so the machine's own integrity
//!   checks pass unmodified
//! - Phase pipeline: decrypt and modify runs are fixed phase sequences
//!   with tagged outcomes, in-place retries, and an always-run cleanup
//! - Everything external (mounts, chroots, the USB token, xorriso,
//!   partclone) sits behind the [`exec::ExecEnvironment`] seam

pub mod baseline;
pub mod config;
pub mod crypto;
mod error;
pub mod exec;
pub mod filelist;
pub mod hash;
pub mod image;
pub mod pipeline;
pub mod progress;

pub use baseline::{detect_changes, ChangeSet, ChecksumBaseline};
pub use config::PipelineConfig;
pub use crypto::{KeystreamProvider, KeystreamSession, ListToken, SessionExtractor};
pub use error::{Error, Result};
pub use filelist::{Asset, FileList};
pub use hash::{ContentHash, HashAlgorithm, Hasher};
pub use pipeline::phases::{spawn_run, PipelineDeps, RunRequest};
pub use pipeline::{
    EventLevel, Phase, PipelineEvent, PipelineHandle, ResultCode, RunMode, RunReport,
};
pub use progress::{LogProgress, ProgressTracker, SilentProgress};
