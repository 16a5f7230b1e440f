// src/commands.rs
//! Command handlers for the jjpatch CLI

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use jjpatch::crypto::keystream::CapturedKeystream;
use jjpatch::exec::HostExec;
use jjpatch::pipeline::cache::ExtractionCache;
use jjpatch::{EventLevel, PipelineConfig, PipelineDeps, PipelineEvent, RunMode, RunRequest};

/// Key material directory the hook writes inside the collected tree
const KEY_MATERIAL_DIR: &str = ".keys";

/// External tools a run shells out to; optional ones only cost a warning
const REQUIRED_TOOLS: &[&str] = &[
    "bash", "xorriso", "blkid", "e2fsck", "mount", "umount", "findmnt", "losetup", "lsusb", "ss",
    "gzip", "split", "partclone.ext4",
];
const OPTIONAL_TOOLS: &[&str] = &["rsync", "pigz"];

fn load_config(config_path: Option<&Path>) -> Result<PipelineConfig> {
    match config_path {
        Some(path) => Ok(PipelineConfig::from_file(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

/// Run the decrypt or modify pipeline and render its event stream
pub fn run_pipeline(
    mode: RunMode,
    image: PathBuf,
    workdir: PathBuf,
    output: Option<PathBuf>,
    config_path: Option<&Path>,
    quiet: bool,
) -> Result<i32> {
    let config = load_config(config_path)?;

    let deps = PipelineDeps {
        exec: Arc::new(HostExec::new()),
        keystream: Arc::new(CapturedKeystream::new(workdir.join(KEY_MATERIAL_DIR))),
    };
    let request = RunRequest {
        mode,
        source_image: image,
        workdir,
        output_image: output,
    };

    info!("starting {} run", mode);
    let handle = jjpatch::spawn_run(config, request, deps)?;

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(200));
        bar
    };

    for event in &handle.events {
        match event {
            PipelineEvent::PhaseChange {
                phase,
                index,
                total,
            } => {
                bar.set_position(0);
                bar.set_length(0);
                bar.set_message(format!("[{}/{}] {}", index + 1, total, phase));
            }
            PipelineEvent::Progress {
                current,
                total,
                detail,
            } => {
                bar.set_length(total);
                bar.set_position(current);
                bar.set_message(detail);
            }
            PipelineEvent::Log { level, line } => match level {
                EventLevel::Info => bar.println(format!("  {}", line)),
                EventLevel::Warn => bar.println(format!("  warning: {}", line)),
                EventLevel::Error => bar.println(format!("  error: {}", line)),
            },
            PipelineEvent::Done(_) => break,
        }
    }
    bar.finish_and_clear();

    let report = handle.wait();
    if report.succeeded() {
        println!(
            "{} run completed in {:.1}s",
            mode,
            report.duration.as_secs_f64()
        );
    } else {
        let phase = report
            .failed_phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "startup".to_string());
        eprintln!("{} run failed during {}: {}", mode, phase, report.message);
        eprintln!("result: {}", report.code);
    }
    Ok(report.code.exit_code())
}

/// List cached raw images
pub fn cache_list(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = ExtractionCache::open(&config.cache_dir)?;
    let entries = cache.entries()?;

    if entries.is_empty() {
        println!("cache is empty ({})", config.cache_dir.display());
        return Ok(());
    }
    println!("cached raw images in {}:", config.cache_dir.display());
    for entry in entries {
        let size = std::fs::metadata(&entry.raw_path)
            .map(|m| m.len())
            .unwrap_or(0);
        println!(
            "  {}  {:>12} bytes  extracted {}",
            entry.fingerprint,
            size,
            entry.created_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}

/// Drop all cached raw images
pub fn cache_clear(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = ExtractionCache::open(&config.cache_dir)?;
    let count = cache.clear()?;
    println!("removed {} cached image(s)", count);
    Ok(())
}

/// Check that the external tools a run shells out to are installed
pub fn check_prerequisites() -> Result<i32> {
    let mut missing = Vec::new();
    for tool in REQUIRED_TOOLS {
        match which::which(tool) {
            Ok(path) => println!("  {:<16} {}", tool, path.display()),
            Err(_) => {
                println!("  {:<16} MISSING", tool);
                missing.push(*tool);
            }
        }
    }
    for tool in OPTIONAL_TOOLS {
        if which::which(tool).is_err() {
            warn!("optional tool {} not found; a slower fallback is used", tool);
        }
    }

    if missing.is_empty() {
        println!("all required tools present");
        Ok(0)
    } else {
        eprintln!("missing required tools: {}", missing.join(", "));
        Ok(1)
    }
}
