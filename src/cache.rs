//! Skip-cache for image optimization.
//!
//! Re-encoding PNGs at maximum compression is the slowest step of a build,
//! and in watch mode the images class rebuilds every image whenever any one
//! of them changes. This cache lets the images converter skip encoding when
//! it has already optimized identical bytes with identical parameters.
//!
//! # Design
//!
//! The cache is **content-addressed**: the key is the pair
//! `(source_hash, params_hash)`, never a path. Renaming or moving an image
//! does not invalidate it; editing the pixels or changing the JPEG quality
//! does.
//!
//! - **`source_hash`**: SHA-256 of the source file contents. Content-based
//!   rather than mtime-based so it survives `git checkout`.
//! - **`params_hash`**: SHA-256 of the output format and quality.
//!
//! A hit requires the manifest entry **and** its blob file to exist. The
//! cached bytes are returned to the build task, which writes them exactly as
//! it would write freshly encoded output, so a hit is indistinguishable
//! from a miss in the destination directory.
//!
//! ## Storage
//!
//! ```text
//! .assetflow-cache/images/
//! ├── manifest.json
//! └── <source-hash>-<params-hash>.bin
//! ```
//!
//! Entries not looked up during a completed build are pruned together with
//! their blobs when that build flushes the cache, so the directory tracks
//! the current set of images instead of growing for the whole session.
//!
//! The directory lives outside the output root: cleans and purges must not
//! wipe it. Pass `--no-cache` to bypass it for one run.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Name of the cache manifest file within the cache directory.
const MANIFEST_FILENAME: &str = "manifest.json";

/// Version of the cache manifest format. Bump this to invalidate all
/// existing caches when the format or key computation changes.
const MANIFEST_VERSION: u32 = 1;

/// A single cached output.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    /// Blob file name within the cache directory.
    pub blob: String,
    pub source_len: u64,
    pub output_len: u64,
}

/// On-disk manifest mapping `"{source_hash}:{params_hash}"` to blobs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheManifest {
    pub version: u32,
    pub entries: HashMap<String, CacheEntry>,
}

impl CacheManifest {
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: HashMap::new(),
        }
    }

    /// Load from the cache directory. Returns an empty manifest if the
    /// file doesn't exist or can't be parsed (version mismatch, corruption).
    pub fn load(dir: &Path) -> Self {
        let content = match std::fs::read_to_string(dir.join(MANIFEST_FILENAME)) {
            Ok(c) => c,
            Err(_) => return Self::empty(),
        };
        match serde_json::from_str::<Self>(&content) {
            Ok(m) if m.version == MANIFEST_VERSION => m,
            _ => Self::empty(),
        }
    }

    pub fn save(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(MANIFEST_FILENAME), json)
    }

    /// Entry for a content key whose blob is still on disk.
    pub fn find(&self, key: &str, dir: &Path) -> Option<&CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| dir.join(&entry.blob).is_file())
    }

    /// Drop every entry whose key is not in `keep`. Returns the blobs that
    /// no remaining entry refers to.
    pub fn prune(&mut self, keep: &HashSet<String>) -> Vec<String> {
        let before: HashSet<String> = self.entries.values().map(|e| e.blob.clone()).collect();
        self.entries.retain(|key, _| keep.contains(key));
        let after: HashSet<String> = self.entries.values().map(|e| e.blob.clone()).collect();
        let mut orphans: Vec<String> = before.into_iter().filter(|b| !after.contains(b)).collect();
        orphans.sort();
        orphans
    }
}

fn content_key(source_hash: &str, params_hash: &str) -> String {
    format!("{}:{}", source_hash, params_hash)
}

fn blob_name(source_hash: &str, params_hash: &str) -> String {
    let short = |h: &str| h.chars().take(32).collect::<String>();
    format!("{}-{}.bin", short(source_hash), short(params_hash))
}

/// SHA-256 of a byte slice, as a hex string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 of the parameters an optimized image depends on.
pub fn hash_image_params(format: &str, quality: u8) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"image\0");
    hasher.update(format.as_bytes());
    hasher.update(b"\0");
    hasher.update([quality]);
    format!("{:x}", hasher.finalize())
}

/// Cache performance for one build.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
}

impl CacheStats {
    pub fn total(&self) -> u32 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(
                f,
                "{} cached, {} optimized ({} total)",
                self.hits,
                self.misses,
                self.total()
            )
        } else {
            write!(f, "{} optimized", self.misses)
        }
    }
}

/// Thread-safe handle on a cache directory.
///
/// Shared by the rayon workers of one images build; the manifest is
/// written back by [`ImageCache::flush`].
pub struct ImageCache {
    dir: PathBuf,
    manifest: Mutex<CacheManifest>,
    stats: Mutex<CacheStats>,
    /// Keys looked up or stored since the last flush.
    used: Mutex<HashSet<String>>,
}

impl ImageCache {
    pub fn open(dir: PathBuf) -> Self {
        let manifest = CacheManifest::load(&dir);
        Self {
            dir,
            manifest: Mutex::new(manifest),
            stats: Mutex::new(CacheStats::default()),
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached output for these source bytes and parameters. Counts a hit or
    /// a miss.
    pub fn get(&self, source_hash: &str, params_hash: &str) -> Option<Vec<u8>> {
        let key = content_key(source_hash, params_hash);
        self.mark_used(&key);
        let blob = {
            let manifest = self.manifest.lock().ok()?;
            manifest.find(&key, &self.dir).map(|e| e.blob.clone())
        };
        let bytes = blob.and_then(|b| std::fs::read(self.dir.join(b)).ok());
        if let Ok(mut stats) = self.stats.lock() {
            match bytes {
                Some(_) => stats.hits += 1,
                None => stats.misses += 1,
            }
        }
        bytes
    }

    /// Store freshly optimized output.
    pub fn put(
        &self,
        source_hash: &str,
        params_hash: &str,
        source_len: usize,
        output: &[u8],
    ) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let key = content_key(source_hash, params_hash);
        self.mark_used(&key);
        let blob = blob_name(source_hash, params_hash);
        std::fs::write(self.dir.join(&blob), output)?;
        let mut manifest = self
            .manifest
            .lock()
            .map_err(|_| io::Error::other("cache manifest lock poisoned"))?;
        manifest.entries.insert(
            key,
            CacheEntry {
                blob,
                source_len: source_len as u64,
                output_len: output.len() as u64,
            },
        );
        Ok(())
    }

    fn mark_used(&self, key: &str) {
        if let Ok(mut used) = self.used.lock() {
            used.insert(key.to_string());
        }
    }

    /// End of a completed build: prune entries the build never asked for,
    /// persist the manifest and return (and reset) the stats since the last
    /// flush.
    pub fn flush(&self) -> io::Result<CacheStats> {
        let stats = self
            .stats
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        let used = self
            .used
            .lock()
            .map(|mut u| std::mem::take(&mut *u))
            .map_err(|_| io::Error::other("cache usage lock poisoned"))?;

        let mut manifest = self
            .manifest
            .lock()
            .map_err(|_| io::Error::other("cache manifest lock poisoned"))?;
        let orphans = manifest.prune(&used);
        for blob in &orphans {
            match std::fs::remove_file(self.dir.join(blob)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        if stats.misses > 0 || !orphans.is_empty() {
            manifest.save(&self.dir)?;
            debug!(
                dir = %self.dir.display(),
                entries = manifest.entries.len(),
                pruned = orphans.len(),
                "saved image cache"
            );
        }
        Ok(stats)
    }

    /// Persist the manifest without pruning, for builds that never finished.
    fn save(&self) -> io::Result<()> {
        let manifest = self
            .manifest
            .lock()
            .map_err(|_| io::Error::other("cache manifest lock poisoned"))?;
        if manifest.entries.is_empty() && !self.dir.exists() {
            return Ok(());
        }
        manifest.save(&self.dir)
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save image cache");
        }
    }
}
