//! Content-addressed judgment cache.
//!
//! Judgments are stored as `<key>.json` files in the cache directory, with an
//! in-memory layer in front. Keys are SHA-256 digests of the grading inputs,
//! so writes for one key always carry the same content and concurrent
//! writers need no coordination. Files are replaced atomically.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::Judgment;
use crate::error::GraderError;
use crate::utils::json::schema_version;

/// Current cached judgment schema version.
pub const CACHE_SCHEMA_VERSION: u64 = 1;

/// Separator between key components.
const KEY_SEPARATOR: &str = "|";

/// Hex-encoded SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a grading request.
    ///
    /// `template_digest` ties the key to the rubric template text, so editing
    /// a template invalidates its judgments.
    pub fn derive(
        rubric: &str,
        prompt: &str,
        response: &str,
        expected: &str,
        template_digest: &str,
    ) -> Self {
        let material = [rubric, prompt, response, expected, template_digest].join(KEY_SEPARATOR);
        Self(hex::encode(Sha256::digest(material.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-disk cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedJudgment {
    schema_version: u64,
    key: String,
    rubric: String,
    judgment: Judgment,
    created_at: DateTime<Utc>,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Two-level (memory, disk) judgment cache.
pub struct JudgmentCache {
    dir: PathBuf,
    memory: RwLock<HashMap<CacheKey, Judgment>>,
    stats: RwLock<CacheStats>,
}

impl JudgmentCache {
    /// Opens (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GraderError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            GraderError::Cache(format!("cannot create cache dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            memory: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Looks up a judgment. Unreadable or foreign-version files count as misses.
    pub fn get(&self, key: &CacheKey) -> Option<Judgment> {
        let hit = self
            .memory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .or_else(|| self.read_disk(key));

        {
            let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
            if hit.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }

        if let Some(ref judgment) = hit {
            self.memory
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.clone(), judgment.clone());
        }
        hit
    }

    fn read_disk(&self, key: &CacheKey) -> Option<Judgment> {
        let path = self.path_for(key);
        let content = fs::read_to_string(&path).ok()?;

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt cache entry");
                return None;
            }
        };

        match schema_version(&value) {
            CACHE_SCHEMA_VERSION => match serde_json::from_value::<CachedJudgment>(value) {
                Ok(record) => Some(record.judgment),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt cache entry");
                    None
                }
            },
            version => {
                debug!(path = %path.display(), version, "Ignoring cache entry with unknown schema");
                None
            }
        }
    }

    /// Stores a judgment in memory and on disk.
    ///
    /// The in-memory entry is kept even if the disk write fails.
    pub fn put(&self, key: &CacheKey, rubric: &str, judgment: &Judgment) -> Result<(), GraderError> {
        self.memory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), judgment.clone());

        let record = CachedJudgment {
            schema_version: CACHE_SCHEMA_VERSION,
            key: key.to_string(),
            rubric: rubric.to_string(),
            judgment: judgment.clone(),
            created_at: Utc::now(),
        };

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, &record)?;
        tmp.flush()?;
        tmp.persist(self.path_for(key))
            .map_err(|e| GraderError::Io(e.error))?;

        self.stats.write().unwrap_or_else(|e| e.into_inner()).writes += 1;
        Ok(())
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of judgments held in memory.
    pub fn len(&self) -> usize {
        self.memory.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
