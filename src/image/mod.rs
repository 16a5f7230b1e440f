// src/image/mod.rs

//! Source image chunk handling and final reassembly
//!
//! The source image stores the game partition as a gzipped partclone
//! stream split into fixed-size chunks (`sda3.ext4-ptcl-img.gz.aa`,
//! `.ab`, ...). Reassembly replaces exactly those chunks inside a copy of
//! the source image and nothing else; the boot regions of the image are
//! never rewritten, only carried over by the splice tool.

pub mod partclone;

use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::exec::{shell_quote, ExecEnvironment};

/// Path fragments that identify boot-critical files inside the image.
/// A replacement set containing any of these is refused outright.
const BOOT_PATHS: &[&str] = &[
    "boot.catalog",
    "boot.cat",
    "isolinux",
    "syslinux",
    "EFI/",
    "efi.img",
    "/boot/",
];

/// One stored chunk of the partition stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub name: String,
    pub size: u64,
}

/// The source image's chunk set for one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// `<partition>.ext4-ptcl-img.gz`
    pub base_name: String,
    /// Exact size every chunk but the last must have, taken from the
    /// first chunk of the source
    pub split_size: u64,
    pub chunks: Vec<ChunkInfo>,
}

impl ChunkLayout {
    /// Build a layout from a directory listing of the image's partition
    /// directory
    pub fn from_listing(partition: &str, listing: &[(String, u64)]) -> Result<Self> {
        let base_name = format!("{}.ext4-ptcl-img.gz", partition);
        let mut chunks: Vec<ChunkInfo> = listing
            .iter()
            .filter(|(name, _)| name.starts_with(&format!("{}.", base_name)))
            .map(|(name, size)| ChunkInfo {
                name: name.clone(),
                size: *size,
            })
            .collect();
        chunks.sort_by(|a, b| a.name.cmp(&b.name));

        if chunks.is_empty() {
            return Err(Error::Format(format!(
                "no {} chunks in source image",
                base_name
            )));
        }
        validate_chunk_set(&base_name, &chunks, None)?;

        let split_size = chunks[0].size;
        if chunks.len() > 1 && chunks.iter().rev().skip(1).any(|c| c.size != split_size) {
            return Err(Error::Format(format!(
                "{}: non-uniform chunk sizes before the last chunk",
                base_name
            )));
        }

        Ok(Self {
            base_name,
            split_size,
            chunks,
        })
    }

    /// Expected suffix of the i-th chunk (`aa`, `ab`, ...)
    pub fn suffix(index: usize) -> String {
        let hi = b'a' + (index / 26) as u8;
        let lo = b'a' + (index % 26) as u8;
        format!("{}{}", hi as char, lo as char)
    }

    /// Check that a freshly produced chunk set can replace this layout's
    /// chunks: same naming scheme, contiguous suffixes, every chunk but
    /// the last exactly `split_size`
    pub fn validate_replacement(&self, replacement: &[ChunkInfo]) -> Result<()> {
        if replacement.is_empty() {
            return Err(Error::Format("replacement chunk set is empty".into()));
        }
        let mut sorted = replacement.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        validate_chunk_set(&self.base_name, &sorted, Some(self.split_size))?;

        for chunk in &sorted {
            if BOOT_PATHS.iter().any(|b| chunk.name.contains(b)) {
                return Err(Error::InvariantViolation(format!(
                    "replacement chunk {} collides with a boot path",
                    chunk.name
                )));
            }
        }
        Ok(())
    }
}

fn validate_chunk_set(
    base_name: &str,
    sorted: &[ChunkInfo],
    split_size: Option<u64>,
) -> Result<()> {
    for (i, chunk) in sorted.iter().enumerate() {
        let expected = format!("{}.{}", base_name, ChunkLayout::suffix(i));
        if chunk.name != expected {
            return Err(Error::Format(format!(
                "chunk {} out of sequence: expected {}",
                chunk.name, expected
            )));
        }
        if let Some(split) = split_size {
            let is_last = i == sorted.len() - 1;
            if !is_last && chunk.size != split {
                return Err(Error::Format(format!(
                    "chunk {} is {} bytes, split size is {}",
                    chunk.name, chunk.size, split
                )));
            }
            if chunk.size > split {
                return Err(Error::Format(format!(
                    "chunk {} exceeds split size {}",
                    chunk.name, split
                )));
            }
        }
    }
    Ok(())
}

/// Whether an image path may be replaced at all
pub fn is_boot_path(path: &str) -> bool {
    BOOT_PATHS.iter().any(|b| path.contains(b))
}

/// Splices rebuilt partition chunks into a copy of the source image
pub struct ImageAssembler<'a> {
    exec: &'a dyn ExecEnvironment,
    timeout: Duration,
}

impl<'a> ImageAssembler<'a> {
    pub fn new(exec: &'a dyn ExecEnvironment, timeout: Duration) -> Self {
        Self { exec, timeout }
    }

    /// Read the partition directory of the source image
    pub fn read_layout(
        &self,
        source: &Path,
        image_dir: &str,
        partition: &str,
    ) -> Result<ChunkLayout> {
        let output = self.exec.run_ok(
            &format!(
                "xorriso -indev {} -find {} -type f -exec lsdl -- 2>/dev/null | awk '{{print $NF, $(NF-3)}}'",
                shell_quote(&source.to_string_lossy()),
                shell_quote(image_dir),
            ),
            self.timeout,
        )?;

        let mut listing = Vec::new();
        for line in output.stdout.lines() {
            let mut parts = line.split_whitespace();
            let (Some(path), Some(size)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(size) = size.parse::<u64>() else {
                continue;
            };
            let name = path.rsplit('/').next().unwrap_or(path).trim_matches('\'');
            listing.push((name.to_string(), size));
        }
        ChunkLayout::from_listing(partition, &listing)
    }

    /// Replace the layout's chunks with the files in `chunk_dir`,
    /// producing `output`; boot records are replayed from the source
    pub fn assemble(
        &self,
        source: &Path,
        layout: &ChunkLayout,
        image_dir: &str,
        chunk_dir: &Path,
        replacement: &[ChunkInfo],
        output: &Path,
    ) -> Result<()> {
        layout.validate_replacement(replacement)?;

        if output.exists() {
            std::fs::remove_file(output)?;
        }

        // One xorriso invocation: open the source, carry its boot
        // records over unchanged, drop the old chunks, map in the new.
        let mut command = format!(
            "xorriso -indev {} -outdev {} -boot_image any replay",
            shell_quote(&source.to_string_lossy()),
            shell_quote(&output.to_string_lossy()),
        );
        command.push_str(&format!(
            " -find {} -name {} -exec rm --",
            shell_quote(image_dir),
            shell_quote(&format!("{}.*", layout.base_name)),
        ));
        for chunk in replacement {
            let local = chunk_dir.join(&chunk.name);
            command.push_str(&format!(
                " -map {} {}/{}",
                shell_quote(&local.to_string_lossy()),
                image_dir,
                chunk.name
            ));
        }

        info!(
            "splicing {} chunk(s) into {}",
            replacement.len(),
            output.display()
        );
        self.exec.run_ok(&command, self.timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockExec;

    fn listing(sizes: &[u64]) -> Vec<(String, u64)> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                (
                    format!("sda3.ext4-ptcl-img.gz.{}", ChunkLayout::suffix(i)),
                    size,
                )
            })
            .collect()
    }

    #[test]
    fn layout_from_listing() {
        let layout =
            ChunkLayout::from_listing("sda3", &listing(&[1_000_000_000, 1_000_000_000, 123]))
                .unwrap();
        assert_eq!(layout.split_size, 1_000_000_000);
        assert_eq!(layout.chunks.len(), 3);
        assert_eq!(layout.chunks[2].name, "sda3.ext4-ptcl-img.gz.ac");
    }

    #[test]
    fn layout_ignores_other_files() {
        let mut files = listing(&[500, 100]);
        files.push(("sda1.vfat-ptcl-img.gz.aa".to_string(), 42));
        files.push(("Info-img.txt".to_string(), 10));
        let layout = ChunkLayout::from_listing("sda3", &files).unwrap();
        assert_eq!(layout.chunks.len(), 2);
    }

    #[test]
    fn layout_rejects_gap_in_suffixes() {
        let files = vec![
            ("sda3.ext4-ptcl-img.gz.aa".to_string(), 100),
            ("sda3.ext4-ptcl-img.gz.ac".to_string(), 100),
        ];
        assert!(ChunkLayout::from_listing("sda3", &files).is_err());
    }

    #[test]
    fn layout_rejects_empty() {
        assert!(ChunkLayout::from_listing("sda3", &[]).is_err());
    }

    #[test]
    fn suffixes_roll_over() {
        assert_eq!(ChunkLayout::suffix(0), "aa");
        assert_eq!(ChunkLayout::suffix(25), "az");
        assert_eq!(ChunkLayout::suffix(26), "ba");
    }

    #[test]
    fn replacement_validation() {
        let layout = ChunkLayout::from_listing("sda3", &listing(&[1000, 1000, 500])).unwrap();

        // Fewer chunks is fine as long as sizes fit the split.
        let ok = vec![
            ChunkInfo {
                name: "sda3.ext4-ptcl-img.gz.aa".into(),
                size: 1000,
            },
            ChunkInfo {
                name: "sda3.ext4-ptcl-img.gz.ab".into(),
                size: 900,
            },
        ];
        assert!(layout.validate_replacement(&ok).is_ok());

        // Interior chunk short of the split size.
        let bad = vec![
            ChunkInfo {
                name: "sda3.ext4-ptcl-img.gz.aa".into(),
                size: 999,
            },
            ChunkInfo {
                name: "sda3.ext4-ptcl-img.gz.ab".into(),
                size: 100,
            },
        ];
        assert!(layout.validate_replacement(&bad).is_err());

        // Oversized final chunk.
        let bad = vec![ChunkInfo {
            name: "sda3.ext4-ptcl-img.gz.aa".into(),
            size: 1001,
        }];
        assert!(layout.validate_replacement(&bad).is_err());

        assert!(layout.validate_replacement(&[]).is_err());
    }

    #[test]
    fn boot_paths_are_guarded() {
        assert!(is_boot_path("/isolinux/isolinux.bin"));
        assert!(is_boot_path("/boot.catalog"));
        assert!(is_boot_path("/EFI/boot/grubx64.efi"));
        assert!(!is_boot_path("/home/partimag/img/sda3.ext4-ptcl-img.gz.aa"));
    }

    #[test]
    fn assemble_issues_single_splice_command() {
        let exec = MockExec::new();
        let dir = tempfile::tempdir().unwrap();
        let layout = ChunkLayout::from_listing("sda3", &listing(&[1000, 400])).unwrap();
        let replacement = vec![ChunkInfo {
            name: "sda3.ext4-ptcl-img.gz.aa".into(),
            size: 800,
        }];

        let assembler = ImageAssembler::new(&exec, Duration::from_secs(60));
        assembler
            .assemble(
                &dir.path().join("source.iso"),
                &layout,
                "/home/partimag/img",
                dir.path(),
                &replacement,
                &dir.path().join("out.iso"),
            )
            .unwrap();

        let history = exec.history();
        assert_eq!(history.len(), 1);
        let cmd = &history[0];
        assert!(cmd.contains("-boot_image any replay"));
        assert!(cmd.contains("-exec rm --"));
        assert!(cmd.contains("-map"));
        assert!(cmd.contains("sda3.ext4-ptcl-img.gz.aa"));
    }
}
