//! Load orchestration.
//!
//! The pipeline decides, per load request, whether a previously compiled
//! artifact may back the requested modules:
//!
//! ```text
//! load(location, loader, extras)
//!   resolver ──> ClasspathContext
//!   assistant.best_candidate(location)
//!        │
//!        ├─ accept ──> registry.register ──────────> modules (backed)
//!        │
//!        └─ reject / none ──> assistant.open_original_modules
//!                                  │
//!                                  └──> modules (unbacked)
//!                                         └──> verifier.schedule
//! ```
//!
//! `load_in_memory` is the path for modules with no file identity: instead
//! of asking the assistant it probes the sidecar cache, and a validated
//! sidecar becomes a non-executable artifact backing the set.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::artifact::{Artifact, ModuleImage};
use crate::assistant::ArtifactAssistant;
use crate::cache::SidecarCache;
use crate::collision::{check_artifact_collision, CollisionCheck};
use crate::config::RuntimeConfig;
use crate::context::{ContextResolver, LoaderRef};
use crate::registry::SharedArtifactRegistry;
use crate::verify::{BackgroundVerifier, VerifierHost};

/// What one load request produced.
#[derive(Debug)]
pub struct LoadOutcome {
    /// Modules now backing the requested location, in load order. Empty
    /// only when loading failed outright; `diagnostics` says why.
    pub modules: Vec<Arc<ModuleImage>>,
    /// The registered artifact the modules came out of, when one was
    /// accepted. `None` for direct loads and failures.
    pub artifact: Option<Arc<Artifact>>,
    /// Human-readable failure notes, one per failed step.
    pub diagnostics: Vec<String>,
}

impl LoadOutcome {
    fn failed(diagnostic: String) -> LoadOutcome {
        LoadOutcome {
            modules: Vec::new(),
            artifact: None,
            diagnostics: vec![diagnostic],
        }
    }
}

/// Top-level coordinator tying the registry, the collision check, the
/// sidecar cache, and the background verifier together.
pub struct LoaderPipeline {
    registry: SharedArtifactRegistry,
    assistant: Arc<dyn ArtifactAssistant>,
    resolver: Arc<dyn ContextResolver>,
    verifier: Arc<BackgroundVerifier>,
    cache: Option<SidecarCache>,
    config: RuntimeConfig,
}

impl LoaderPipeline {
    /// Wire up a pipeline. The background verifier is created here and
    /// publishes into the same `cache` the pipeline probes, so verified
    /// module sets become reusable on their next load.
    pub fn new(
        registry: SharedArtifactRegistry,
        assistant: Arc<dyn ArtifactAssistant>,
        resolver: Arc<dyn ContextResolver>,
        host: Arc<dyn VerifierHost>,
        cache: Option<SidecarCache>,
        config: RuntimeConfig,
    ) -> LoaderPipeline {
        let verifier = Arc::new(BackgroundVerifier::new(
            cache.clone(),
            host,
            config.clone(),
        ));
        LoaderPipeline {
            registry,
            assistant,
            resolver,
            verifier,
            cache,
            config,
        }
    }

    pub fn registry(&self) -> &SharedArtifactRegistry {
        &self.registry
    }

    pub fn verifier(&self) -> &Arc<BackgroundVerifier> {
        &self.verifier
    }

    /// Load the modules at `location`, preferring a compiled artifact.
    ///
    /// `extra_modules` are modules the caller already injected into the
    /// loader outside the normal chain; they take part in context
    /// resolution. The outcome is never silently partial: an empty module
    /// list always carries at least one diagnostic.
    pub fn load(
        &self,
        location: &str,
        loader: Option<&LoaderRef>,
        extra_modules: &[Arc<ModuleImage>],
    ) -> LoadOutcome {
        let mut diagnostics: Vec<String> = Vec::new();

        let context = match loader {
            Some(loader) => {
                let context = self.resolver.resolve(loader, extra_modules);
                if context.is_none() {
                    warn!(
                        location,
                        loader = %loader.describe(),
                        "Unsupported class loader chain, collision checking disabled"
                    );
                }
                context
            }
            None => {
                warn!(location, "Opening an artifact without a class loader");
                None
            }
        };

        let mut modules: Vec<Arc<ModuleImage>> = Vec::new();
        let mut artifact_handle: Option<Arc<Artifact>> = None;

        // A candidate is only considered when the caller supplied a loader
        // or extra modules. Bare loads must not map compiled code the
        // classpath was never checked against.
        let candidate = self.assistant.best_candidate(location);
        if let Some(candidate) = candidate {
            if loader.is_some() || !extra_modules.is_empty() {
                let check = check_artifact_collision(&candidate, context.as_deref());
                let mut accept = check.accepts();
                if !accept {
                    if let CollisionCheck::HasCollisions(report) = &check {
                        warn!(location, %report, "Candidate artifact defines duplicate classes");
                    }
                    if !self.assistant.has_original_modules(location) {
                        // Nothing to fall back to. Refusing would leave the
                        // caller with no modules at all, so take the
                        // artifact and say so loudly.
                        accept = true;
                        warn!(
                            location,
                            "No original modules to fall back to, accepting the artifact anyway"
                        );
                    } else if self.config.module_fallback {
                        warn!(location, "Falling back to loading original modules directly");
                    } else {
                        warn!(
                            location,
                            "Module fallback disabled, classes from this location will fail to load"
                        );
                    }
                }
                if accept {
                    let handle = self.registry.register(candidate);
                    if handle.modules().is_empty() {
                        diagnostics.push(format!(
                            "no loadable modules in artifact {}",
                            handle.location()
                        ));
                    } else {
                        modules = handle.modules().to_vec();
                        artifact_handle = Some(handle);
                    }
                }
            }
        }

        // Direct loading of the original module files, for rejected or
        // absent artifacts.
        if modules.is_empty() {
            if self.assistant.has_original_modules(location) {
                if self.config.module_fallback {
                    match self.assistant.open_original_modules(location) {
                        Ok(originals) if !originals.is_empty() => {
                            debug!(
                                location,
                                count = originals.len(),
                                "Loaded original modules directly"
                            );
                            modules = originals;
                        }
                        Ok(_) => {
                            diagnostics
                                .push(format!("no modules found in original files for {location}"));
                        }
                        Err(err) => {
                            warn!(location, error = %err, "Failed to open original modules");
                            diagnostics.push(format!(
                                "failed to open original modules for {location}: {err}"
                            ));
                        }
                    }
                } else {
                    diagnostics
                        .push("module fallback disabled, skipping original modules".to_string());
                }
            } else {
                diagnostics.push(format!("no original modules found for location {location}"));
            }
        }

        // Modules running without compiled backing are worth verifying in
        // the background so a sidecar can cover their next load. Artifact
        // backed loads were already verified at compile time.
        if artifact_handle.is_none() && !modules.is_empty() {
            if let (Some(loader), Some(context)) = (loader, context.as_ref()) {
                self.verifier.schedule(
                    modules.clone(),
                    Arc::clone(loader),
                    context.encode_signature(),
                );
            }
        }

        LoadOutcome {
            modules,
            artifact: artifact_handle,
            diagnostics,
        }
    }

    /// Load modules that exist only in memory.
    ///
    /// The module set is keyed by content; a cached sidecar that passes
    /// checksum, platform fingerprint, and context checks backs the set
    /// with a non-executable artifact. Otherwise the modules are returned
    /// unbacked and verification is scheduled so the next identical load
    /// hits the cache.
    pub fn load_in_memory(
        &self,
        modules: Vec<Arc<ModuleImage>>,
        loader: Option<&LoaderRef>,
    ) -> LoadOutcome {
        if modules.is_empty() {
            return LoadOutcome::failed("no modules supplied for in-memory load".to_string());
        }

        let context = match loader {
            Some(loader) => {
                let context = self.resolver.resolve(loader, &[]);
                if context.is_none() {
                    warn!(
                        loader = %loader.describe(),
                        "Unsupported class loader chain for in-memory modules"
                    );
                }
                context
            }
            None => None,
        };

        let mut artifact_handle: Option<Arc<Artifact>> = None;
        if let Some(cache) = &self.cache {
            let key = cache.key_for(&modules);
            if let Some(sidecar) = cache.read(&key) {
                match context.as_deref() {
                    Some(context) => {
                        match sidecar.validate(&modules, &self.config.platform_fingerprint, context)
                        {
                            Ok(()) => {
                                debug!(location = key.location(), "Backing modules with cached sidecar");
                                let artifact = Artifact::from_sidecar(
                                    key.location(),
                                    modules.clone(),
                                    sidecar.context_signature.clone(),
                                );
                                artifact_handle = Some(self.registry.register(artifact));
                            }
                            Err(err) => {
                                warn!(
                                    location = key.location(),
                                    error = %err,
                                    "Ignoring cached sidecar"
                                );
                            }
                        }
                    }
                    None => {
                        // A sidecar records what one particular chain made
                        // visible; without the live context there is no way
                        // to tell whether that still holds.
                        debug!(
                            location = key.location(),
                            "Cached sidecar present but no classpath context, not reusing it"
                        );
                    }
                }
            }
        }

        if artifact_handle.is_none() {
            if let (Some(loader), Some(context)) = (loader, context.as_ref()) {
                self.verifier.schedule(
                    modules.clone(),
                    Arc::clone(loader),
                    context.encode_signature(),
                );
            }
        }

        LoadOutcome {
            modules,
            artifact: artifact_handle,
            diagnostics: Vec::new(),
        }
    }
}
