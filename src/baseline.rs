// src/baseline.rs

//! Checksum baseline and change detection for the decrypted work tree
//!
//! After a decrypt run, every collected file is hashed and the result is
//! written next to the tree. Before re-encryption the tree is hashed
//! again and compared: only files whose hash moved (or which are new) are
//! re-encrypted. Deleted files are reported separately; the modify
//! pipeline refuses to run when any exist, because the manifest cannot
//! describe an absent asset.

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::{BASELINE_NAME, DECRYPTED_LIST_NAME};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::progress::ProgressTracker;

/// Relative path -> content hash, as recorded after a decrypt run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumBaseline {
    pub algorithm: HashAlgorithm,
    pub entries: BTreeMap<String, String>,
}

impl ChecksumBaseline {
    /// Hash every eligible file under `workdir`
    pub fn capture(workdir: &Path, algorithm: HashAlgorithm) -> Result<Self> {
        let paths = eligible_files(workdir)?;
        let entries: Result<BTreeMap<_, _>> = paths
            .par_iter()
            .map(|rel| {
                let hash = hash::hash_file(algorithm, &workdir.join(rel))?;
                Ok((rel.clone(), hash.value))
            })
            .collect();
        Ok(Self {
            algorithm,
            entries: entries?,
        })
    }

    /// Parse baseline text: a `# algorithm: <name>` header, then one
    /// `<hash>  <relative path>` line per file
    pub fn parse(text: &str) -> Result<Self> {
        let mut algorithm = HashAlgorithm::default();
        let mut entries = BTreeMap::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                if let Some(name) = rest.trim().strip_prefix("algorithm:") {
                    algorithm = name.trim().parse()?;
                }
                continue;
            }
            let (hash, path) = line.split_once("  ").ok_or_else(|| {
                Error::Format(format!("baseline line {}: missing separator", lineno + 1))
            })?;
            // Tolerate the binary-mode marker some sum tools emit.
            let path = path.strip_prefix('*').unwrap_or(path);
            if hash.len() != algorithm.hex_len()
                || !hash.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(Error::Format(format!(
                    "baseline line {}: malformed {} hash",
                    lineno + 1,
                    algorithm
                )));
            }
            entries.insert(path.to_string(), hash.to_lowercase());
        }

        Ok(Self { algorithm, entries })
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("# algorithm: {}\n", self.algorithm);
        for (path, hash) in &self.entries {
            out.push_str(&format!("{}  {}\n", hash, path));
        }
        out
    }

    pub fn load(workdir: &Path) -> Result<Self> {
        let path = workdir.join(BASELINE_NAME);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::Format(format!("no baseline at {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn save(&self, workdir: &Path) -> Result<()> {
        let path = workdir.join(BASELINE_NAME);
        let mut file = std::fs::File::create(&path)?;
        file.write_all(self.serialize().as_bytes())?;
        Ok(())
    }
}

/// Result of comparing a work tree against its baseline; paths are
/// relative, sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Present in both, content differs
    pub modified: Vec<String>,
    /// On disk but not in the baseline
    pub added: Vec<String>,
    /// In the baseline but gone from disk
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.deleted.is_empty()
    }

    /// Files that need re-encryption
    pub fn to_reencrypt(&self) -> impl Iterator<Item = &String> {
        self.modified.iter().chain(self.added.iter())
    }
}

/// Compare `workdir` against `baseline`
pub fn detect_changes(
    workdir: &Path,
    baseline: &ChecksumBaseline,
    progress: &dyn ProgressTracker,
) -> Result<ChangeSet> {
    let paths = eligible_files(workdir)?;
    progress.set_length(paths.len() as u64);

    let hashed: Result<Vec<(String, String)>> = paths
        .par_iter()
        .map(|rel| {
            let hash = hash::hash_file(baseline.algorithm, &workdir.join(rel))?;
            progress.increment(1);
            Ok((rel.clone(), hash.value))
        })
        .collect();

    let mut changes = ChangeSet::default();
    let mut on_disk = std::collections::BTreeSet::new();
    for (rel, hash) in hashed? {
        on_disk.insert(rel.clone());
        match baseline.entries.get(&rel) {
            Some(recorded) if *recorded == hash => {}
            Some(_) => changes.modified.push(rel),
            None => changes.added.push(rel),
        }
    }
    for rel in baseline.entries.keys() {
        if !on_disk.contains(rel) {
            changes.deleted.push(rel.clone());
        }
    }

    progress.finish_with_message("scan complete");
    Ok(changes)
}

/// Files under `workdir` that participate in baselines: everything except
/// dot entries (files and whole directories, so captured key material
/// under `.keys/` stays out), the decrypted manifest, and raw image
/// artifacts
fn eligible_files(workdir: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    let walker = WalkDir::new(workdir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
        });
    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy() == DECRYPTED_LIST_NAME {
            continue;
        }
        if entry.path().extension().is_some_and(|e| e == "img") {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workdir)
            .map_err(|e| Error::InvariantViolation(e.to_string()))?;
        paths.push(rel.to_string_lossy().replace('\\', "/"));
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("edata")).unwrap();
        std::fs::write(dir.path().join("edata/a.bin"), b"alpha").unwrap();
        std::fs::write(dir.path().join("edata/b.bin"), b"beta").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"notes").unwrap();
        // Excluded from baselines
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join(".keys")).unwrap();
        std::fs::write(dir.path().join(".keys/0011223344556677.ks"), b"x").unwrap();
        std::fs::write(dir.path().join(DECRYPTED_LIST_NAME), b"x").unwrap();
        std::fs::write(dir.path().join("raw.img"), b"x").unwrap();
        dir
    }

    #[test]
    fn capture_skips_excluded_files() {
        let dir = fixture();
        let baseline = ChecksumBaseline::capture(dir.path(), HashAlgorithm::Xxh128).unwrap();
        let keys: Vec<_> = baseline.entries.keys().cloned().collect();
        assert_eq!(keys, vec!["edata/a.bin", "edata/b.bin", "readme.txt"]);
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let dir = fixture();
        let baseline = ChecksumBaseline::capture(dir.path(), HashAlgorithm::Xxh128).unwrap();
        let parsed = ChecksumBaseline::parse(&baseline.serialize()).unwrap();
        assert_eq!(parsed, baseline);
    }

    #[test]
    fn save_and_load() {
        let dir = fixture();
        let baseline = ChecksumBaseline::capture(dir.path(), HashAlgorithm::Xxh128).unwrap();
        baseline.save(dir.path()).unwrap();
        let loaded = ChecksumBaseline::load(dir.path()).unwrap();
        assert_eq!(loaded, baseline);
    }

    #[test]
    fn unchanged_tree_yields_empty_changeset() {
        let dir = fixture();
        let baseline = ChecksumBaseline::capture(dir.path(), HashAlgorithm::Xxh128).unwrap();
        let changes = detect_changes(dir.path(), &baseline, &SilentProgress::new()).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn detects_exactly_the_mutated_set() {
        let dir = fixture();
        let baseline = ChecksumBaseline::capture(dir.path(), HashAlgorithm::Xxh128).unwrap();

        std::fs::write(dir.path().join("edata/a.bin"), b"ALPHA'").unwrap();
        std::fs::write(dir.path().join("edata/new.bin"), b"fresh").unwrap();
        std::fs::remove_file(dir.path().join("edata/b.bin")).unwrap();

        let changes = detect_changes(dir.path(), &baseline, &SilentProgress::new()).unwrap();
        assert_eq!(changes.modified, vec!["edata/a.bin"]);
        assert_eq!(changes.added, vec!["edata/new.bin"]);
        assert_eq!(changes.deleted, vec!["edata/b.bin"]);

        let reencrypt: Vec<_> = changes.to_reencrypt().cloned().collect();
        assert_eq!(reencrypt, vec!["edata/a.bin", "edata/new.bin"]);
    }

    #[test]
    fn malformed_baseline_rejected() {
        assert!(ChecksumBaseline::parse("not a baseline\n").is_err());
        assert!(ChecksumBaseline::parse("zzzz  path\n").is_err());
    }
}
