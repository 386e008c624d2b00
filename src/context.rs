//! Classpath-context collaborator surface.
//!
//! The class-loading side of the runtime owns class loaders and knows how
//! to encode a loader chain into a signature string. This crate only needs
//! three things from it: compare a live chain against the signature an
//! artifact was compiled with, flatten the chain into the modules it
//! already exposes, and encode the chain for recording. Everything else
//! about loaders stays opaque.

use std::any::Any;
use std::sync::Arc;

use crate::artifact::ModuleImage;

/// Opaque handle to the class-loader chain a load request came from.
///
/// The crate never inspects loaders; it clones references to keep them
/// alive across background work and prints their description in logs.
pub trait ClassLoader: Send + Sync {
    /// Short human-readable description used in diagnostics.
    fn describe(&self) -> String;

    /// Escape hatch for collaborator implementations that need their
    /// concrete loader type back.
    fn as_any(&self) -> &dyn Any;
}

/// Shared loader reference. Background tasks hold a clone for their whole
/// run so the chain outlives queued work.
pub type LoaderRef = Arc<dyn ClassLoader>;

/// Result of comparing a live context against a recorded signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMatch {
    /// The live chain is what the artifact was compiled against.
    Matches,
    /// The chains differ; only a full collision merge can vet the
    /// artifact.
    Mismatch,
    /// The recorded signature carries the shared-library marker: the
    /// compiler already opted out of context checks for this artifact.
    ForceSkip,
}

/// A resolved classpath context for one loader chain.
pub trait ClasspathContext: Send + Sync {
    /// Compare this context against the signature recorded in an artifact
    /// at compile time.
    fn compare_signature(&self, recorded: &str) -> SignatureMatch;

    /// Every module already visible through the chain, outermost loader
    /// first. The collision merge treats these as the "loaded" side.
    fn flattened_loaded_modules(&self) -> Vec<Arc<ModuleImage>>;

    /// Encode the live chain into a signature string, the same encoding
    /// compilers record into artifacts.
    fn encode_signature(&self) -> String;
}

/// Builds [`ClasspathContext`] values from loader chains.
pub trait ContextResolver: Send + Sync {
    /// Resolve the context for `loader` plus any modules injected beside
    /// it. `None` means the chain topology is unsupported and collision
    /// checks must be skipped optimistically.
    fn resolve(
        &self,
        loader: &LoaderRef,
        extra_modules: &[Arc<ModuleImage>],
    ) -> Option<Box<dyn ClasspathContext>>;
}
