//! On-disk verification sidecar format.
//!
//! A sidecar records which classes of a module set were proven verifiable,
//! together with everything needed to decide later whether those results
//! still apply: the module checksums, the platform image identity, and the
//! classpath-context signature at verification time. Files are published
//! atomically (temp file in the cache directory, then rename), so readers
//! never observe a torn write and concurrent writers degrade to
//! last-writer-wins.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::artifact::ModuleImage;
use crate::context::{ClasspathContext, SignatureMatch};

/// Version stamped into every sidecar; decode refuses anything else.
pub const SIDECAR_FORMAT_VERSION: u32 = 1;

/// Errors raised while reading, writing, or validating a sidecar.
#[derive(Debug)]
pub enum SidecarError {
    /// Filesystem failure at the given path.
    Io(PathBuf, std::io::Error),
    /// Serialization failed.
    Encode(String),
    /// The file is not a structurally valid sidecar.
    Decode(String),
    /// The file was written by a different format version.
    WrongVersion(u32),
    /// The sidecar covers a different number of modules.
    ModuleCountMismatch { expected: usize, found: usize },
    /// A module checksum changed since verification.
    ChecksumMismatch {
        location: String,
        expected: u32,
        found: u32,
    },
    /// The platform image changed since verification.
    FingerprintMismatch,
    /// The classpath context no longer matches.
    ContextMismatch,
}

impl fmt::Display for SidecarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarError::Io(path, err) => {
                write!(f, "sidecar I/O failed at {}: {}", path.display(), err)
            }
            SidecarError::Encode(msg) => write!(f, "failed to encode sidecar: {}", msg),
            SidecarError::Decode(msg) => write!(f, "failed to decode sidecar: {}", msg),
            SidecarError::WrongVersion(found) => write!(
                f,
                "sidecar format version {} (supported: {})",
                found, SIDECAR_FORMAT_VERSION
            ),
            SidecarError::ModuleCountMismatch { expected, found } => write!(
                f,
                "sidecar covers {} modules, load supplied {}",
                found, expected
            ),
            SidecarError::ChecksumMismatch {
                location,
                expected,
                found,
            } => write!(
                f,
                "module {} changed since verification (checksum {:#010x}, sidecar has {:#010x})",
                location, expected, found
            ),
            SidecarError::FingerprintMismatch => {
                write!(f, "sidecar was produced against a different platform image")
            }
            SidecarError::ContextMismatch => {
                write!(f, "sidecar was produced under a different classpath context")
            }
        }
    }
}

impl std::error::Error for SidecarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SidecarError::Io(_, err) => Some(err),
            _ => None,
        }
    }
}

pub type SidecarResult<T> = Result<T, SidecarError>;

/// Verified-class summary for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDeps {
    pub location: String,
    pub checksum: u32,
    /// Descriptors proven verifiable, in scan order.
    pub verified_classes: Vec<String>,
}

/// One verification sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarFile {
    pub format_version: u32,
    /// Seconds since the epoch at publication time.
    pub created_at: u64,
    pub platform_fingerprint: String,
    pub context_signature: String,
    pub per_module: Vec<ModuleDeps>,
}

impl SidecarFile {
    pub fn new(
        platform_fingerprint: impl Into<String>,
        context_signature: impl Into<String>,
        per_module: Vec<ModuleDeps>,
    ) -> SidecarFile {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        SidecarFile {
            format_version: SIDECAR_FORMAT_VERSION,
            created_at,
            platform_fingerprint: platform_fingerprint.into(),
            context_signature: context_signature.into(),
            per_module,
        }
    }

    /// Publish atomically at `path`: encode, write to a temp file in the
    /// same directory, rename over the final name.
    pub fn write_to(&self, path: &Path) -> SidecarResult<()> {
        let dir = path.parent().ok_or_else(|| {
            SidecarError::Io(
                path.to_path_buf(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
            )
        })?;
        fs::create_dir_all(dir).map_err(|e| SidecarError::Io(dir.to_path_buf(), e))?;

        let bytes = bincode::serialize(self).map_err(|e| SidecarError::Encode(e.to_string()))?;

        let mut tmp =
            NamedTempFile::new_in(dir).map_err(|e| SidecarError::Io(dir.to_path_buf(), e))?;
        tmp.write_all(&bytes)
            .map_err(|e| SidecarError::Io(tmp.path().to_path_buf(), e))?;
        tmp.persist(path)
            .map_err(|e| SidecarError::Io(path.to_path_buf(), e.error))?;
        Ok(())
    }

    /// Read and structurally validate the sidecar at `path`.
    pub fn read_from(path: &Path) -> SidecarResult<SidecarFile> {
        let bytes = fs::read(path).map_err(|e| SidecarError::Io(path.to_path_buf(), e))?;
        let sidecar: SidecarFile =
            bincode::deserialize(&bytes).map_err(|e| SidecarError::Decode(e.to_string()))?;
        if sidecar.format_version != SIDECAR_FORMAT_VERSION {
            return Err(SidecarError::WrongVersion(sidecar.format_version));
        }
        Ok(sidecar)
    }

    /// Check the recorded module checksums against `modules`, in order.
    pub fn validate_checksums(&self, modules: &[Arc<ModuleImage>]) -> SidecarResult<()> {
        if self.per_module.len() != modules.len() {
            return Err(SidecarError::ModuleCountMismatch {
                expected: modules.len(),
                found: self.per_module.len(),
            });
        }
        for (deps, module) in self.per_module.iter().zip(modules) {
            if deps.checksum != module.checksum() {
                return Err(SidecarError::ChecksumMismatch {
                    location: module.location().to_string(),
                    expected: module.checksum(),
                    found: deps.checksum,
                });
            }
        }
        Ok(())
    }

    /// Full revalidation before cached results may back a load: module
    /// checksums, platform image identity, and classpath context.
    pub fn validate(
        &self,
        modules: &[Arc<ModuleImage>],
        platform_fingerprint: &str,
        context: &dyn ClasspathContext,
    ) -> SidecarResult<()> {
        self.validate_checksums(modules)?;
        if self.platform_fingerprint != platform_fingerprint {
            return Err(SidecarError::FingerprintMismatch);
        }
        if context.compare_signature(&self.context_signature) != SignatureMatch::Matches {
            return Err(SidecarError::ContextMismatch);
        }
        Ok(())
    }
}
