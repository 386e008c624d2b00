//! Sidecar cache for anonymous modules.
//!
//! Modules loaded from memory have no stable path identity, so their
//! verification sidecars live in one flat directory keyed by a digest of
//! the module checksums. The directory is bounded: before each insert the
//! cache evicts least-recently-accessed sidecars until the new file fits
//! under the capacity. Everything here is best-effort; a failed eviction
//! or write costs a re-verification later, never a load.

pub mod sidecar;

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::artifact::ModuleImage;
use self::sidecar::{SidecarError, SidecarFile};

/// Basename prefix of every cached sidecar.
pub const ANONYMOUS_PREFIX: &str = "anonymous-module@";
/// Basename suffix of every cached sidecar.
pub const SIDECAR_SUFFIX: &str = ".deps";
/// How many sidecars the cache directory may hold.
pub const SIDECAR_CACHE_CAPACITY: usize = 16;
/// Environment override for the cache directory.
pub const CACHE_DIR_ENV: &str = "QUIVER_CACHE_DIR";

/// Errors raised while maintaining the cache directory.
#[derive(Debug)]
pub enum CacheError {
    /// Listing the cache directory failed.
    List(PathBuf, std::io::Error),
    /// Reading an entry's metadata failed.
    Inspect(PathBuf, std::io::Error),
    /// Deleting an entry failed.
    Remove(PathBuf, std::io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::List(path, err) => {
                write!(f, "failed to list cache directory {}: {}", path.display(), err)
            }
            CacheError::Inspect(path, err) => {
                write!(f, "failed to inspect cache entry {}: {}", path.display(), err)
            }
            CacheError::Remove(path, err) => {
                write!(f, "failed to remove cache entry {}: {}", path.display(), err)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::List(_, err)
            | CacheError::Inspect(_, err)
            | CacheError::Remove(_, err) => Some(err),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Content-derived identity of one anonymous module set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    digest: u64,
    location: String,
    sidecar_path: PathBuf,
}

impl CacheKey {
    /// The raw digest over module count and checksums.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    /// Synthetic location naming the module set in the registry and logs.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Where the sidecar for this module set lives.
    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }
}

/// Bounded directory of verification sidecars.
#[derive(Debug, Clone)]
pub struct SidecarCache {
    dir: PathBuf,
    capacity: usize,
}

impl SidecarCache {
    /// Cache in the platform's per-user cache directory, honoring the
    /// `QUIVER_CACHE_DIR` override. `None` when no writable location
    /// exists; such processes simply run uncached.
    pub fn open_default() -> Option<SidecarCache> {
        let dir = match env::var_os(CACHE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::cache_dir()?.join("quiver").join("sidecars"),
        };
        Some(SidecarCache::at(dir))
    }

    /// Cache rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> SidecarCache {
        SidecarCache::with_capacity(dir, SIDECAR_CACHE_CAPACITY)
    }

    /// Cache with a non-default capacity.
    pub fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> SidecarCache {
        assert!(capacity > 0, "sidecar cache capacity must be positive");
        SidecarCache {
            dir: dir.into(),
            capacity,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Key for an ordered module set. Deterministic: the same checksums in
    /// the same order always produce the same key.
    pub fn key_for(&self, modules: &[Arc<ModuleImage>]) -> CacheKey {
        let digest = digest_checksums(modules);
        let location = format!("{}{:016x}", ANONYMOUS_PREFIX, digest);
        let sidecar_path = self.dir.join(format!("{}{}", location, SIDECAR_SUFFIX));
        CacheKey {
            digest,
            location,
            sidecar_path,
        }
    }

    /// Make room for an insert at `sidecar_path`.
    ///
    /// Overwriting an existing sidecar never evicts, so rewriting a key is
    /// idempotent. A missing cache directory means an empty cache. When at
    /// least `capacity` sidecars exist, the least-recently-accessed ones
    /// are deleted until `capacity - 1` remain.
    pub fn evict_for(&self, sidecar_path: &Path) -> CacheResult<()> {
        if sidecar_path.exists() {
            return Ok(());
        }

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(CacheError::List(self.dir.clone(), err)),
        };

        let mut cached: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::List(self.dir.clone(), e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_sidecar_basename(name) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| CacheError::Inspect(path.clone(), e))?;
            if !meta.is_file() {
                continue;
            }
            // Not every filesystem surfaces access times; modification
            // time keeps the ordering deterministic there.
            let accessed = meta
                .accessed()
                .or_else(|_| meta.modified())
                .map_err(|e| CacheError::Inspect(path.clone(), e))?;
            cached.push((accessed, path));
        }

        if cached.len() < self.capacity {
            return Ok(());
        }

        // Newest first; everything past the first capacity-1 entries is
        // the least-recently-used tail.
        cached.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for (_, path) in cached.drain(self.capacity - 1..) {
            debug!(path = %path.display(), "Evicting least-recently-used sidecar");
            fs::remove_file(&path).map_err(|e| CacheError::Remove(path.clone(), e))?;
        }
        Ok(())
    }

    /// The sidecar stored under `key`, if a structurally valid one exists.
    /// Corrupt or unreadable files are logged and treated as missing.
    pub fn read(&self, key: &CacheKey) -> Option<SidecarFile> {
        match SidecarFile::read_from(&key.sidecar_path) {
            Ok(sidecar) => Some(sidecar),
            Err(SidecarError::Io(_, err)) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    path = %key.sidecar_path.display(),
                    error = %err,
                    "Ignoring unusable sidecar"
                );
                None
            }
        }
    }

    /// Number of sidecars currently in the directory. Used by tests and
    /// diagnostics; non-sidecar files are not counted.
    pub fn occupancy(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(is_sidecar_basename)
                    .unwrap_or(false)
            })
            .count()
    }
}

/// Whether `name` looks like a cached anonymous sidecar.
pub fn is_sidecar_basename(name: &str) -> bool {
    name.starts_with(ANONYMOUS_PREFIX) && name.ends_with(SIDECAR_SUFFIX)
}

fn digest_checksums(modules: &[Arc<ModuleImage>]) -> u64 {
    let mut hasher = DefaultHasher::new();
    modules.len().hash(&mut hasher);
    for module in modules {
        module.checksum().hash(&mut hasher);
    }
    hasher.finish()
}
