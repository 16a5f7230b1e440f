// src/config.rs

//! Pipeline configuration
//!
//! Defaults match the machine's on-disk layout (mount prefix, game tree,
//! image repository, partition name) and the timing envelopes of its
//! external tools. Anything can be overridden from a TOML file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// USB vendor:product of the Sentinel HASP token
pub const HASP_VID_PID: &str = "0529:0001";

/// Port the license daemon answers on once a session is possible
pub const HASP_DAEMON_PORT: u16 = 1947;

/// Encrypted file list name inside the image
pub const FILE_LIST_NAME: &str = "fl.dat";

/// Decrypted file list written next to collected assets
pub const DECRYPTED_LIST_NAME: &str = "fl_decrypted.dat";

/// Baseline written after a successful decrypt run
pub const BASELINE_NAME: &str = ".baseline.sums";

/// Directory prefix assets live under inside the game tree
pub const ENCRYPTED_DATA_PREFIX: &str = "/edata/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Where extracted raw images are cached between decrypt runs
    pub cache_dir: PathBuf,

    /// Mount point prefix; each run appends a unique tag
    pub mount_prefix: String,

    /// Root of the vendor game tree inside the mounted image
    pub game_base_path: String,

    /// Partition holding the game filesystem inside the source image
    pub game_partition: String,

    /// Directory inside the source image holding the partition chunk set
    pub image_dir: String,

    /// Lock file guarding the mounted image and the token
    pub lock_path: PathBuf,

    /// Directory holding the hook sources compiled into the image
    pub hook_dir: PathBuf,

    /// Daemon binary started inside the mounted image for token sessions
    pub license_daemon_path: String,

    /// Paths bind-mounted into the chroot
    pub bind_mounts: Vec<String>,

    /// Shared library names stubbed out when absent from the image
    pub stub_sonames: Vec<String>,

    /// Known game directory names and their display titles
    pub known_games: BTreeMap<String, String>,

    /// Retry attempts for retryable phase failures
    pub max_attempts: u32,

    /// Base retry delay; attempt N waits N times this
    #[serde(with = "duration_secs")]
    pub retry_wait: Duration,

    #[serde(with = "duration_secs")]
    pub mount_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub extract_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub compile_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub transform_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub copy_timeout: Duration,

    /// How long to wait for the license daemon to answer after start
    #[serde(with = "duration_secs")]
    pub daemon_ready_timeout: Duration,

    /// How long to wait for the token to enumerate after attach
    #[serde(with = "duration_secs")]
    pub usb_settle_timeout: Duration,

    /// How many unmodified assets to spot-check after re-encryption
    pub verify_sample_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("jjpatch");
        Self {
            cache_dir,
            mount_prefix: "/mnt/jjp_".to_string(),
            game_base_path: "/jjpe/gen1".to_string(),
            game_partition: "sda3".to_string(),
            image_dir: "/home/partimag/img".to_string(),
            lock_path: std::env::temp_dir().join("jjpatch.lock"),
            hook_dir: PathBuf::from("hooks"),
            license_daemon_path: "/usr/sbin/hasplmd_x86_64".to_string(),
            bind_mounts: ["/proc", "/sys", "/dev", "/dev/pts", "/dev/shm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            stub_sonames: vec![
                "libusb-0.1.so.4".to_string(),
                "libpng12.so.0".to_string(),
            ],
            known_games: [
                ("wonka", "Willy Wonka"),
                ("dilly", "Dialed In"),
                ("pirates", "Pirates of the Caribbean"),
                ("hobbit", "The Hobbit"),
                ("wizardofoz", "The Wizard of Oz"),
                ("gnr", "Guns N' Roses"),
                ("toystory", "Toy Story 4"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            max_attempts: 3,
            retry_wait: Duration::from_secs(5),
            mount_timeout: Duration::from_secs(60),
            extract_timeout: Duration::from_secs(3600),
            compile_timeout: Duration::from_secs(60),
            transform_timeout: Duration::from_secs(600),
            copy_timeout: Duration::from_secs(600),
            daemon_ready_timeout: Duration::from_secs(15),
            usb_settle_timeout: Duration::from_secs(10),
            verify_sample_size: 20,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// absent keys
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Display title for a detected game directory name
    pub fn game_title(&self, name: &str) -> String {
        self.known_games
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
