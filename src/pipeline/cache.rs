// src/pipeline/cache.rs

//! Extraction cache for raw partition images
//!
//! Extracting the game partition from a source image takes the better
//! part of an hour, so decrypt runs keep the raw image around, keyed by a
//! content fingerprint of the compressed source. Modify runs never reuse
//! a cached image: an image extracted before an earlier modify run would
//! compound that run's edits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};

const INDEX_NAME: &str = "index.json";

/// One cached raw image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    /// XXH128 of the complete compressed source image
    pub fingerprint: String,
    /// Raw ext4 image extracted from it
    pub raw_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: Vec<CacheEntry>,
}

/// Directory of cached raw images plus a JSON index
pub struct ExtractionCache {
    dir: PathBuf,
}

impl ExtractionCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Fingerprint a source image by streaming its full content
    pub fn fingerprint(source: &Path) -> Result<String> {
        Ok(hash::hash_file(HashAlgorithm::Xxh128, source)?.value)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_NAME)
    }

    fn load_index(&self) -> Result<CacheIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(CacheIndex::default());
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Cache(format!("corrupt index {}: {}", path.display(), e)))
    }

    fn save_index(&self, index: &CacheIndex) -> Result<()> {
        let text = serde_json::to_string_pretty(index)
            .map_err(|e| Error::Cache(e.to_string()))?;
        std::fs::write(self.index_path(), text)?;
        Ok(())
    }

    /// Path a raw image for this fingerprint would live at
    pub fn raw_path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("raw_{}.img", fingerprint))
    }

    /// Look up a usable cached image; entries whose file vanished are
    /// dropped from the index on the way through
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let mut index = self.load_index()?;
        let before = index.entries.len();
        index.entries.retain(|e| e.raw_path.exists());
        if index.entries.len() != before {
            self.save_index(&index)?;
        }

        let hit = index
            .entries
            .iter()
            .find(|e| e.fingerprint == fingerprint)
            .cloned();
        if let Some(entry) = &hit {
            info!(
                "cache hit for {} (extracted {})",
                fingerprint, entry.created_at
            );
        } else {
            debug!("cache miss for {}", fingerprint);
        }
        Ok(hit)
    }

    /// Record a freshly extracted raw image
    pub fn insert(&self, fingerprint: &str, raw_path: &Path) -> Result<CacheEntry> {
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            raw_path: raw_path.to_path_buf(),
            created_at: Utc::now(),
        };
        let mut index = self.load_index()?;
        index.entries.retain(|e| e.fingerprint != fingerprint);
        index.entries.push(entry.clone());
        self.save_index(&index)?;
        Ok(entry)
    }

    /// Drop one entry and its raw image
    pub fn invalidate(&self, fingerprint: &str) -> Result<()> {
        let mut index = self.load_index()?;
        if let Some(entry) = index.entries.iter().find(|e| e.fingerprint == fingerprint) {
            if entry.raw_path.exists() {
                std::fs::remove_file(&entry.raw_path)?;
            }
        }
        index.entries.retain(|e| e.fingerprint != fingerprint);
        self.save_index(&index)
    }

    /// Remove every cached image
    pub fn clear(&self) -> Result<usize> {
        let index = self.load_index()?;
        let count = index.entries.len();
        for entry in &index.entries {
            if entry.raw_path.exists() {
                std::fs::remove_file(&entry.raw_path)?;
            }
        }
        self.save_index(&CacheIndex::default())?;
        Ok(count)
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.load_index()?.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insert_then_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = ExtractionCache::open(dir.path()).unwrap();

        let raw = cache.raw_path_for("abc123");
        std::fs::write(&raw, b"raw image bytes").unwrap();
        cache.insert("abc123", &raw).unwrap();

        let hit = cache.lookup("abc123").unwrap().unwrap();
        assert_eq!(hit.raw_path, raw);
        assert!(cache.lookup("other").unwrap().is_none());
    }

    #[test]
    fn missing_raw_file_drops_entry() {
        let dir = TempDir::new().unwrap();
        let cache = ExtractionCache::open(dir.path()).unwrap();

        let raw = cache.raw_path_for("gone");
        std::fs::write(&raw, b"x").unwrap();
        cache.insert("gone", &raw).unwrap();
        std::fs::remove_file(&raw).unwrap();

        assert!(cache.lookup("gone").unwrap().is_none());
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn invalidate_removes_file_and_entry() {
        let dir = TempDir::new().unwrap();
        let cache = ExtractionCache::open(dir.path()).unwrap();

        let raw = cache.raw_path_for("fp");
        std::fs::write(&raw, b"x").unwrap();
        cache.insert("fp", &raw).unwrap();

        cache.invalidate("fp").unwrap();
        assert!(!raw.exists());
        assert!(cache.lookup("fp").unwrap().is_none());
    }

    #[test]
    fn clear_empties_cache() {
        let dir = TempDir::new().unwrap();
        let cache = ExtractionCache::open(dir.path()).unwrap();
        for fp in ["a", "b"] {
            let raw = cache.raw_path_for(fp);
            std::fs::write(&raw, b"x").unwrap();
            cache.insert(fp, &raw).unwrap();
        }
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn fingerprint_is_content_keyed() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.iso");
        let b = dir.path().join("b.iso");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        assert_eq!(
            ExtractionCache::fingerprint(&a).unwrap(),
            ExtractionCache::fingerprint(&b).unwrap()
        );
    }
}
