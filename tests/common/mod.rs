//! Shared stubs and builders for integration tests.
//!
//! Artifact discovery, context resolution, and class verification are all
//! external collaborators of the crate; the types here give tests
//! deterministic versions of each, plus builders for modules and
//! artifacts with process-unique base addresses.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use quiver::{
    Artifact, ArtifactAssistant, ClassLoader, ClasspathContext, CompileFilter, ContextResolver,
    LoaderRef, ModuleImage, SignatureMatch, VerifierHost, VerifyDisposition,
};

static INIT_LOGS: Once = Once::new();

/// Route tracing output through the test harness. Safe to call from every
/// test; only the first call installs a subscriber.
pub fn init_logs() {
    INIT_LOGS.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Named loader stub. The crate only clones, logs, and passes it through
/// to the collaborators.
pub struct TestLoader {
    name: String,
}

impl TestLoader {
    pub fn named(name: &str) -> LoaderRef {
        Arc::new(TestLoader {
            name: name.to_string(),
        })
    }
}

impl ClassLoader for TestLoader {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn test_loader() -> LoaderRef {
    TestLoader::named("test-loader")
}

/// Context with a fixed signature and a fixed flattened module list.
///
/// With `deny_flatten` set, any attempt to walk the loaded modules panics.
/// Tests use that to prove a load was accepted without running the
/// collision merge.
pub struct StaticContext {
    signature: String,
    loaded: Vec<Arc<ModuleImage>>,
    force_skip: bool,
    deny_flatten: bool,
}

impl ClasspathContext for StaticContext {
    fn compare_signature(&self, recorded: &str) -> SignatureMatch {
        if self.force_skip {
            SignatureMatch::ForceSkip
        } else if recorded == self.signature {
            SignatureMatch::Matches
        } else {
            SignatureMatch::Mismatch
        }
    }

    fn flattened_loaded_modules(&self) -> Vec<Arc<ModuleImage>> {
        assert!(
            !self.deny_flatten,
            "collision merge ran on a load that should have skipped it"
        );
        self.loaded.clone()
    }

    fn encode_signature(&self) -> String {
        self.signature.clone()
    }
}

/// Resolver producing [`StaticContext`] values, or `None` when marked
/// unsupported.
pub struct StaticResolver {
    signature: String,
    loaded: Vec<Arc<ModuleImage>>,
    supported: bool,
    force_skip: bool,
    deny_flatten: bool,
}

impl StaticResolver {
    pub fn new(signature: &str) -> StaticResolver {
        StaticResolver {
            signature: signature.to_string(),
            loaded: vec![],
            supported: true,
            force_skip: false,
            deny_flatten: false,
        }
    }

    /// Modules the live chain already makes visible.
    pub fn with_loaded(mut self, loaded: Vec<Arc<ModuleImage>>) -> StaticResolver {
        self.loaded = loaded;
        self
    }

    /// Resolve to `None`, as for an unrecognized loader chain topology.
    pub fn unsupported(mut self) -> StaticResolver {
        self.supported = false;
        self
    }

    /// Answer every signature comparison with the shared-library marker.
    pub fn force_skip(mut self) -> StaticResolver {
        self.force_skip = true;
        self
    }

    /// Panic if anything flattens the context's module list.
    pub fn deny_flatten(mut self) -> StaticResolver {
        self.deny_flatten = true;
        self
    }
}

impl ContextResolver for StaticResolver {
    fn resolve(
        &self,
        _loader: &LoaderRef,
        _extra_modules: &[Arc<ModuleImage>],
    ) -> Option<Box<dyn ClasspathContext>> {
        if !self.supported {
            return None;
        }
        Some(Box::new(StaticContext {
            signature: self.signature.clone(),
            loaded: self.loaded.clone(),
            force_skip: self.force_skip,
            deny_flatten: self.deny_flatten,
        }))
    }
}

/// Scripted assistant: hands out at most one candidate artifact, like a
/// real assistant opening the file on disk, and serves a fixed set of
/// original modules.
pub struct StubAssistant {
    candidate: Mutex<Option<Artifact>>,
    originals: Option<Vec<Arc<ModuleImage>>>,
}

impl StubAssistant {
    pub fn new(
        candidate: Option<Artifact>,
        originals: Option<Vec<Arc<ModuleImage>>>,
    ) -> StubAssistant {
        StubAssistant {
            candidate: Mutex::new(candidate),
            originals,
        }
    }

    /// No candidate, no originals: every load through this fails.
    pub fn empty() -> StubAssistant {
        StubAssistant::new(None, None)
    }
}

impl ArtifactAssistant for StubAssistant {
    fn best_candidate(&self, _location: &str) -> Option<Artifact> {
        self.candidate.lock().take()
    }

    fn has_original_modules(&self, _location: &str) -> bool {
        self.originals.is_some()
    }

    fn open_original_modules(&self, location: &str) -> Result<Vec<Arc<ModuleImage>>, String> {
        self.originals
            .clone()
            .ok_or_else(|| format!("no original modules for {location}"))
    }
}

/// Host that verifies every class it is asked about and counts the calls.
pub struct RecordingHost {
    calls: AtomicUsize,
}

impl RecordingHost {
    pub fn new() -> Arc<RecordingHost> {
        Arc::new(RecordingHost {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VerifierHost for RecordingHost {
    fn resolve_and_verify(
        &self,
        _loader: &LoaderRef,
        _module: &ModuleImage,
        _descriptor: &str,
    ) -> VerifyDisposition {
        self.calls.fetch_add(1, Ordering::SeqCst);
        VerifyDisposition::Verified
    }
}

static NEXT_BASE: AtomicUsize = AtomicUsize::new(0x6000_0000);

/// Module with every listed descriptor defined.
pub fn module(location: &str, checksum: u32, classes: &[&str]) -> Arc<ModuleImage> {
    Arc::new(ModuleImage::new(location, checksum, classes.iter().copied()))
}

/// Executable artifact with a process-unique base address.
pub fn artifact(location: &str, signature: &str, modules: Vec<Arc<ModuleImage>>) -> Artifact {
    Artifact::new(
        location,
        NEXT_BASE.fetch_add(0x10_000, Ordering::Relaxed),
        0x1000,
        true,
        CompileFilter::Speed,
        signature,
        modules,
    )
}
