//! Runtime configuration shared by the loader pipeline and the background
//! verifier.
//!
//! The embedding runtime builds one [`RuntimeConfig`] at startup and hands
//! clones to the components that need it. All knobs are plain fields; the
//! shutdown flag is the one piece of shared mutable state, flipped by the
//! embedder when the process begins to wind down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Platform release a program declares as its minimum supported target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlatformVersion(pub u32);

impl PlatformVersion {
    /// First release that ships verification sidecars. Programs targeting
    /// anything older never get background verification.
    pub const BACKGROUND_VERIFY: PlatformVersion = PlatformVersion(10);
}

/// Knobs controlling artifact acceptance and background verification.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Debuggable processes can redefine classes at any time, so cached
    /// verification results cannot be trusted across loads.
    pub debuggable: bool,
    /// Minimum platform version the running program declares.
    pub target_version: PlatformVersion,
    /// Whether a rejected artifact may fall back to loading modules from
    /// their original uncompiled form.
    pub module_fallback: bool,
    /// Identity of the platform image this process booted from. Stamped
    /// into sidecars and checked before any cached result is reused.
    pub platform_fingerprint: String,
    /// Path prefix of the read-only system partition. While the
    /// only-system policy is active, executable artifacts outside this
    /// prefix are refused at registration.
    pub system_prefix: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            debuggable: false,
            target_version: PlatformVersion::BACKGROUND_VERIFY,
            module_fallback: true,
            platform_fingerprint: String::new(),
            system_prefix: PathBuf::from("/system"),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RuntimeConfig {
    /// Production defaults with the given platform image identity.
    pub fn new(platform_fingerprint: impl Into<String>) -> Self {
        RuntimeConfig {
            platform_fingerprint: platform_fingerprint.into(),
            ..Default::default()
        }
    }

    /// Configuration for a debuggable process. Classes may be redefined
    /// at any time, so background verification never runs.
    pub fn debuggable(platform_fingerprint: impl Into<String>) -> Self {
        RuntimeConfig {
            debuggable: true,
            ..RuntimeConfig::new(platform_fingerprint)
        }
    }

    /// Whether the embedder has started tearing the process down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Mark the process as shutting down. Irreversible; every clone of this
    /// config observes the flag.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
