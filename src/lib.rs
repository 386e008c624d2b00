//! Quiver - Compiled Artifact Manager
//!
//! This library manages the lifetime, registration, and integrity of
//! compiled code artifacts backing dynamically loaded bytecode modules.
//! It decides at load time whether a previously compiled artifact may
//! safely back a requested module, maintains a bounded filesystem cache of
//! verification sidecars for modules loaded from memory, and coordinates
//! background verification of modules running without compiled backing.
//!
//! # Architecture
//!
//! A load request flows through five components:
//!
//! 1. **LoaderPipeline** (`pipeline` module)
//!    - Resolves the classpath context for the requesting loader
//!    - Picks the best candidate artifact via the external assistant
//!    - Applies the collision check and the fallback policy
//!
//! 2. **CollisionDetector** (`collision` module)
//!    - Merges the sorted class tables of loaded and candidate modules
//!    - Reports every class defined on both sides of the merge
//!    - Skips the merge entirely when context signatures already match
//!
//! 3. **ArtifactRegistry** (`registry` module)
//!    - Process-wide set of open artifact handles
//!    - Enforces base-address uniqueness and the only-system policy
//!    - Answers location queries and produces the diagnostics dump
//!
//! 4. **SidecarCache** (`cache` module)
//!    - Bounded directory of verification sidecars for anonymous modules
//!    - Content-derived keys, least-recently-accessed eviction
//!    - Atomic publication via temp file plus rename
//!
//! 5. **BackgroundVerifier** (`verify` module)
//!    - Lazily created worker pool fed by a bounded channel
//!    - Verifies classes through the external host and publishes sidecars
//!    - Gated off for debuggable runtimes and legacy target versions
//!
//! The embedding runtime supplies the external collaborators: an
//! [`ArtifactAssistant`] that finds and opens artifacts, a
//! [`ContextResolver`] that encodes class-loader chains, and a
//! [`VerifierHost`] that resolves and verifies single classes.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use quiver::{find_duplicate_classes, ModuleImage};
//!
//! let loaded = vec![Arc::new(ModuleImage::new(
//!     "/system/framework/base.pack",
//!     0xAA,
//!     ["La/Shared;", "Lb/Base;"],
//! ))];
//! let candidate = vec![Arc::new(ModuleImage::new(
//!     "/data/app/app.pack",
//!     0xBB,
//!     ["La/Shared;", "Lc/App;"],
//! ))];
//!
//! let report = find_duplicate_classes(&loaded, &candidate);
//! assert!(report.has_collisions());
//! assert_eq!(report.duplicates()[0].descriptor.as_ref(), "La/Shared;");
//! ```

pub mod artifact;
pub mod assistant;
pub mod cache;
pub mod collision;
pub mod config;
pub mod context;
pub mod pipeline;
pub mod registry;
pub mod verify;

pub use artifact::{base_location_of, Artifact, CompileFilter, ModuleImage, Origin};
pub use assistant::ArtifactAssistant;
pub use cache::{
    sidecar::{ModuleDeps, SidecarFile},
    CacheKey, SidecarCache, SIDECAR_CACHE_CAPACITY,
};
pub use collision::{
    check_artifact_collision, find_duplicate_classes, CollisionCheck, CollisionReport,
    DuplicateClass, Provenance,
};
pub use config::{PlatformVersion, RuntimeConfig};
pub use context::{ClassLoader, ClasspathContext, ContextResolver, LoaderRef, SignatureMatch};
pub use pipeline::{LoadOutcome, LoaderPipeline};
pub use registry::{ArtifactRegistry, SharedArtifactRegistry};
pub use verify::{BackgroundVerifier, VerifierHost, VerifyDisposition};
