//! Background verification of freshly loaded modules.
//!
//! Verifying classes up front costs startup latency, so loads return
//! immediately and verification runs on a small worker pool afterwards.
//! A finished task publishes a sidecar into the anonymous cache; the next
//! load of the same module set picks it up and skips verification
//! entirely. Scheduling is best-effort from end to end: any gate that
//! fails, any full queue, any I/O error just means the modules get
//! verified again later.

mod pool;

use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::artifact::ModuleImage;
use crate::cache::sidecar::{ModuleDeps, SidecarFile};
use crate::cache::{CacheKey, SidecarCache};
use crate::config::{PlatformVersion, RuntimeConfig};
use crate::context::LoaderRef;

use self::pool::VerifierPool;

/// What the external resolver/verifier concluded about one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyDisposition {
    /// Resolved in the expected module and passed verification.
    Verified,
    /// Resolved, but to a different module that shadows this one; the
    /// result would not apply to this module, so nothing is recorded.
    ShadowedElsewhere,
    /// Resolution failed. The failure is cleared on the spot and the
    /// class is skipped.
    Unresolvable,
    /// Verification found structural errors; nothing is recorded.
    Erroneous,
}

/// External class resolution and verification service.
pub trait VerifierHost: Send + Sync {
    /// Resolve `descriptor` through `loader` and verify it against
    /// `module`. Must clear any per-class failure state before returning;
    /// a background task never carries failures forward.
    fn resolve_and_verify(
        &self,
        loader: &LoaderRef,
        module: &ModuleImage,
        descriptor: &str,
    ) -> VerifyDisposition;
}

/// Removes the in-flight marker for a key when its task ends, whether the
/// task ran, was shed by a full queue, or was discarded at shutdown.
struct InflightGuard {
    keys: Arc<DashSet<u64>>,
    digest: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.digest);
    }
}

/// One queued verification run. Everything the worker needs travels in
/// the struct; the loader reference keeps the chain alive until the task
/// ends.
pub(crate) struct VerificationTask {
    modules: Vec<Arc<ModuleImage>>,
    loader: LoaderRef,
    context_signature: String,
    platform_fingerprint: String,
    key: CacheKey,
    cache: SidecarCache,
    host: Arc<dyn VerifierHost>,
    _inflight: InflightGuard,
}

impl VerificationTask {
    pub(crate) fn run(self) {
        debug!(
            location = self.key.location(),
            modules = self.modules.len(),
            loader = %self.loader.describe(),
            "Background verification started"
        );

        let mut per_module = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let mut verified = Vec::new();
            for descriptor in module.defined_descriptors() {
                match self.host.resolve_and_verify(&self.loader, module, descriptor) {
                    VerifyDisposition::Verified => verified.push(descriptor.to_string()),
                    VerifyDisposition::ShadowedElsewhere => {}
                    VerifyDisposition::Unresolvable | VerifyDisposition::Erroneous => {
                        trace!(
                            class = descriptor,
                            module = module.location(),
                            "Class skipped during background verification"
                        );
                    }
                }
            }
            per_module.push(ModuleDeps {
                location: module.location().to_string(),
                checksum: module.checksum(),
                verified_classes: verified,
            });
        }

        if let Err(err) = self.cache.evict_for(self.key.sidecar_path()) {
            warn!(error = %err, "Sidecar eviction failed, abandoning cache write");
            return;
        }

        let sidecar = SidecarFile::new(
            self.platform_fingerprint,
            self.context_signature,
            per_module,
        );
        match sidecar.write_to(self.key.sidecar_path()) {
            Ok(()) => debug!(
                path = %self.key.sidecar_path().display(),
                "Verification sidecar published"
            ),
            Err(err) => warn!(error = %err, "Failed to publish verification sidecar"),
        }
    }
}

/// Schedules and runs verification tasks on a lazily created pool.
pub struct BackgroundVerifier {
    cache: Option<SidecarCache>,
    host: Arc<dyn VerifierHost>,
    config: RuntimeConfig,
    pool: Mutex<Option<VerifierPool>>,
    inflight: Arc<DashSet<u64>>,
}

impl BackgroundVerifier {
    /// A verifier publishing into `cache`. `None` disables scheduling
    /// entirely, for processes without a writable cache directory.
    pub fn new(
        cache: Option<SidecarCache>,
        host: Arc<dyn VerifierHost>,
        config: RuntimeConfig,
    ) -> BackgroundVerifier {
        BackgroundVerifier {
            cache,
            host,
            config,
            pool: Mutex::new(None),
            inflight: Arc::new(DashSet::new()),
        }
    }

    /// Queue a verification run for `modules` under `loader`.
    ///
    /// Returns whether a task was actually queued. Every refusal is
    /// silent towards the caller and logged here: shutdown in progress,
    /// debuggable runtime, program targeting a release without sidecars,
    /// no usable cache, the same module set already in flight, or a full
    /// queue.
    pub fn schedule(
        &self,
        modules: Vec<Arc<ModuleImage>>,
        loader: LoaderRef,
        context_signature: String,
    ) -> bool {
        if modules.is_empty() {
            return false;
        }
        if self.config.is_shutting_down() {
            debug!("Skipping background verification: shutting down");
            return false;
        }
        if self.config.debuggable {
            debug!("Skipping background verification: debuggable runtime");
            return false;
        }
        if self.config.target_version < PlatformVersion::BACKGROUND_VERIFY {
            debug!(
                target = self.config.target_version.0,
                "Skipping background verification: program targets a release without sidecars"
            );
            return false;
        }
        let Some(cache) = &self.cache else {
            debug!("Skipping background verification: no sidecar cache");
            return false;
        };

        let key = cache.key_for(&modules);
        if !self.inflight.insert(key.digest()) {
            debug!(
                location = key.location(),
                "Skipping background verification: already in flight"
            );
            return false;
        }
        let task = VerificationTask {
            modules,
            loader,
            context_signature,
            platform_fingerprint: self.config.platform_fingerprint.clone(),
            cache: cache.clone(),
            host: Arc::clone(&self.host),
            _inflight: InflightGuard {
                keys: Arc::clone(&self.inflight),
                digest: key.digest(),
            },
            key,
        };

        let mut pool = self.pool.lock();
        if self.config.is_shutting_down() {
            // Lost the race with shutdown; the guard clears the marker.
            return false;
        }
        pool.get_or_insert_with(|| VerifierPool::new(num_cpus::get().min(2)))
            .submit(task)
    }

    /// Block until every queued task has finished. New work can still be
    /// scheduled afterwards.
    pub fn wait_for_tasks(&self) {
        let pool = self.pool.lock();
        if let Some(pool) = pool.as_ref() {
            pool.wait_idle();
        }
    }

    /// Tear the pool down: tasks that never started are discarded,
    /// running ones finish first. Idempotent; no workers are created
    /// afterwards as long as the config's shutdown flag is set.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown();
        }
    }
}
