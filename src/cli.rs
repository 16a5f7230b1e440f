// src/cli.rs
//! CLI definitions for the jjpatch tool
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "jjpatch")]
#[command(version)]
#[command(about = "Decrypt and re-encrypt JJP pinball assets inside Clonezilla images", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML); defaults apply for absent keys
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Suppress progress bars, log lines only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract a Clonezilla image and decrypt its assets into a working
    /// directory
    Decrypt {
        /// Path to the Clonezilla source image
        image: PathBuf,

        /// Directory to collect the decrypted asset tree into
        #[arg(short, long)]
        workdir: PathBuf,
    },

    /// Re-encrypt modified assets and rebuild a bootable image
    Modify {
        /// Path to the pristine Clonezilla source image
        image: PathBuf,

        /// Working directory holding the edited asset tree
        #[arg(short, long)]
        workdir: PathBuf,

        /// Where to write the rebuilt image
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Manage the extracted raw image cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Check that the external tools a run needs are installed
    Check,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cached raw images
    List,

    /// Remove all cached raw images
    Clear,
}
