//! Process-wide registry of open compiled artifacts.
//!
//! One registry exists per runtime. It owns the canonical reference to
//! every open artifact and answers lookup queries from the loader. A
//! single reader-writer lock guards the set; register, unregister, and
//! policy flips take the write side, every lookup takes the read side,
//! and the lock is never held across calls into other components.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::artifact::{base_location_of, Artifact, Origin};

/// How the registry is usually shared between the pipeline and embedder.
pub type SharedArtifactRegistry = Arc<ArtifactRegistry>;

struct RegistryInner {
    /// Registration order is load order; the first non-boot entry is the
    /// primary artifact.
    artifacts: Vec<Arc<Artifact>>,
    only_system_artifacts: bool,
}

/// Process-wide set of open artifacts.
pub struct ArtifactRegistry {
    inner: RwLock<RegistryInner>,
    system_prefix: PathBuf,
}

impl ArtifactRegistry {
    /// Registry enforcing `system_prefix` as the system partition when the
    /// only-system policy is active.
    pub fn new(system_prefix: impl Into<PathBuf>) -> ArtifactRegistry {
        ArtifactRegistry {
            inner: RwLock::new(RegistryInner {
                artifacts: Vec::new(),
                only_system_artifacts: false,
            }),
            system_prefix: system_prefix.into(),
        }
    }

    /// Register `artifact` and return the shared handle.
    ///
    /// Registering an executable artifact from outside the system
    /// partition while the only-system policy is active is a caller bug
    /// and aborts. Debug builds additionally verify that no registered
    /// artifact shares the new one's base address.
    pub fn register(&self, artifact: Artifact) -> Arc<Artifact> {
        let mut inner = self.inner.write();
        assert!(
            !inner.only_system_artifacts
                || !artifact.is_executable()
                || artifact.is_under(&self.system_prefix),
            "executable artifact {} registered outside {} while the only-system policy is active",
            artifact.location(),
            self.system_prefix.display(),
        );

        #[cfg(debug_assertions)]
        for existing in &inner.artifacts {
            debug_assert!(
                existing.begin() != artifact.begin(),
                "artifact {} registered at an address already claimed by {}",
                artifact.location(),
                existing.location(),
            );
            if existing.location() == artifact.location() {
                debug!(
                    location = artifact.location(),
                    "Registering a second artifact for the same location"
                );
            }
        }

        let handle = Arc::new(artifact);
        inner.artifacts.push(handle.clone());
        debug!(
            location = handle.location(),
            begin = handle.begin(),
            "Artifact registered"
        );
        handle
    }

    /// Remove `handle` from the registry and hand its reference back.
    ///
    /// The caller keeps the artifact alive for as long as it needs it; the
    /// backing mapping goes away when the last clone drops. Unregistering
    /// a handle that was never registered is a caller bug and aborts.
    pub fn unregister(&self, handle: &Arc<Artifact>) -> Arc<Artifact> {
        let mut inner = self.inner.write();
        let position = inner
            .artifacts
            .iter()
            .position(|a| Arc::ptr_eq(a, handle));
        match position {
            Some(index) => {
                let owned = inner.artifacts.remove(index);
                debug!(location = owned.location(), "Artifact unregistered");
                owned
            }
            None => panic!(
                "unregistering artifact {} that is not registered",
                handle.location()
            ),
        }
    }

    /// First artifact containing a module whose base location matches
    /// `location` (any multi-entry suffix on the query is ignored).
    pub fn find_by_module_location(&self, location: &str) -> Option<Arc<Artifact>> {
        let base = base_location_of(location);
        let inner = self.inner.read();
        inner
            .artifacts
            .iter()
            .find(|a| a.modules().iter().any(|m| m.base_location() == base))
            .cloned()
    }

    /// First artifact whose own location matches `location` exactly.
    pub fn find_by_artifact_location(&self, location: &str) -> Option<Arc<Artifact>> {
        let inner = self.inner.read();
        inner
            .artifacts
            .iter()
            .find(|a| a.location() == location)
            .cloned()
    }

    /// The first registered non-boot artifact, i.e. the one backing the
    /// program that started this process.
    pub fn primary_artifact(&self) -> Option<Arc<Artifact>> {
        let inner = self.inner.read();
        inner
            .artifacts
            .iter()
            .find(|a| !a.is_boot())
            .cloned()
    }

    /// Register the platform's base image set. Origins are forced to
    /// [`Origin::BootImage`] regardless of what the artifacts carried.
    pub fn register_boot_image(&self, artifacts: Vec<Artifact>) -> Vec<Arc<Artifact>> {
        artifacts
            .into_iter()
            .map(|a| self.register(a.with_origin(Origin::BootImage)))
            .collect()
    }

    /// Every registered boot-image artifact.
    pub fn boot_artifacts(&self) -> Vec<Arc<Artifact>> {
        let inner = self.inner.read();
        inner
            .artifacts
            .iter()
            .filter(|a| a.is_boot())
            .cloned()
            .collect()
    }

    /// Switch the only-system policy.
    ///
    /// With `assert_none_loaded`, aborts if an executable artifact from
    /// outside the system partition is already registered; enabling the
    /// policy after such a load is a sequencing bug in the embedder. Boot
    /// image artifacts are exempt, they are trusted wherever they live.
    pub fn set_only_system_artifacts(&self, enforce: bool, assert_none_loaded: bool) {
        let mut inner = self.inner.write();
        if enforce && assert_none_loaded {
            for artifact in inner.artifacts.iter().filter(|a| !a.is_boot()) {
                assert!(
                    !artifact.is_executable() || artifact.is_under(&self.system_prefix),
                    "only-system policy enabled after loading executable artifact {}",
                    artifact.location(),
                );
            }
        }
        inner.only_system_artifacts = enforce;
    }

    /// SIGQUIT-style report: one `location: compile-filter` line per
    /// registered non-boot artifact, in registration order.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.read();
        for artifact in inner.artifacts.iter().filter(|a| !a.is_boot()) {
            writeln!(out, "{}: {}", artifact.location(), artifact.compile_filter())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().artifacts.is_empty()
    }
}
