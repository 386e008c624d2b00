//! Artifact selection oracle.
//!
//! Deciding which compiled artifact is up to date for a module location,
//! and opening module files in their original uncompiled form, belong to
//! the compilation side of the runtime. The pipeline consumes that service
//! through this trait.

use std::sync::Arc;

use crate::artifact::{Artifact, ModuleImage};

/// Picks compiled artifacts for module locations and opens originals when
/// the pipeline falls back.
pub trait ArtifactAssistant: Send + Sync {
    /// The best up-to-date artifact for `location`, if one exists.
    fn best_candidate(&self, location: &str) -> Option<Artifact>;

    /// Whether module files in their original uncompiled form still exist
    /// for `location`. Decides between falling back and accepting a
    /// rejected artifact anyway.
    fn has_original_modules(&self, location: &str) -> bool;

    /// Open the original module files directly, bypassing compiled
    /// artifacts. The error string is surfaced to the caller as a load
    /// diagnostic.
    fn open_original_modules(&self, location: &str) -> Result<Vec<Arc<ModuleImage>>, String>;
}
