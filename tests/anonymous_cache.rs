//! End-to-end tests for anonymous in-memory loads and the sidecar cache.
//!
//! These drive `load_in_memory` through the full cycle: first load
//! schedules background verification, the published sidecar backs the
//! next identical load, and the bounded cache directory evicts its
//! least-recently-used entries as new module sets arrive.

mod common;

use std::fs;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use common::{init_logs, module, test_loader, RecordingHost, StaticResolver, StubAssistant};
use quiver::{ArtifactRegistry, LoaderPipeline, ModuleImage, RuntimeConfig, SidecarCache};

fn memory_pipeline(
    resolver: StaticResolver,
    cache: SidecarCache,
    host: Arc<RecordingHost>,
    config: RuntimeConfig,
) -> LoaderPipeline {
    LoaderPipeline::new(
        Arc::new(ArtifactRegistry::new(config.system_prefix.clone())),
        Arc::new(StubAssistant::empty()),
        Arc::new(resolver),
        host,
        Some(cache),
        config,
    )
}

#[test]
fn test_verification_round_trip_backs_the_second_load() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = SidecarCache::at(dir.path());
    let host = RecordingHost::new();
    let pipeline = memory_pipeline(
        StaticResolver::new("ctx"),
        cache.clone(),
        host.clone(),
        RuntimeConfig::new("fp"),
    );

    let mods: Vec<Arc<ModuleImage>> = vec![module("mem-a", 0x11, &["La;", "Lb;"])];

    // First load: nothing cached yet, modules come back unbacked and a
    // verification task is queued.
    let first = pipeline.load_in_memory(mods.clone(), Some(&test_loader()));
    assert!(first.artifact.is_none());
    assert_eq!(first.modules.len(), 1);

    pipeline.verifier().wait_for_tasks();
    assert_eq!(host.call_count(), 2);
    assert_eq!(cache.occupancy(), 1);

    // Second load of the same module set reuses the sidecar.
    let second = pipeline.load_in_memory(mods.clone(), Some(&test_loader()));
    let handle = second.artifact.as_ref().unwrap();
    assert!(!handle.is_executable());
    assert!(handle.location().starts_with("anonymous-module@"));
    assert_eq!(handle.modules().len(), 1);

    // No re-verification happened for the cached load.
    assert_eq!(host.call_count(), 2);

    let found = pipeline
        .registry()
        .find_by_artifact_location(handle.location());
    assert!(found.is_some_and(|f| Arc::ptr_eq(&f, handle)));
}

#[test]
fn test_cache_keeps_only_the_most_recent_module_sets() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = SidecarCache::with_capacity(dir.path(), 2);
    let pipeline = memory_pipeline(
        StaticResolver::new("ctx"),
        cache.clone(),
        RecordingHost::new(),
        RuntimeConfig::new("fp"),
    );

    let sets: Vec<Vec<Arc<ModuleImage>>> = (0u32..3)
        .map(|i| vec![module(&format!("mem-{i}"), 0x20 + i, &["La;"])])
        .collect();

    for set in &sets {
        pipeline.load_in_memory(set.clone(), Some(&test_loader()));
        pipeline.verifier().wait_for_tasks();
        // Distinct timestamps keep the access ordering unambiguous.
        sleep(Duration::from_millis(20));
    }

    assert_eq!(cache.occupancy(), 2);
    assert!(!cache.key_for(&sets[0]).sidecar_path().exists());
    assert!(cache.key_for(&sets[1]).sidecar_path().exists());
    assert!(cache.key_for(&sets[2]).sidecar_path().exists());
}

#[test]
fn test_platform_fingerprint_change_forces_reverification() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = SidecarCache::at(dir.path());
    let mods: Vec<Arc<ModuleImage>> = vec![module("mem-b", 0x31, &["La;"])];

    // Populate the cache under the old platform image.
    let old = memory_pipeline(
        StaticResolver::new("ctx"),
        cache.clone(),
        RecordingHost::new(),
        RuntimeConfig::new("fp-old"),
    );
    old.load_in_memory(mods.clone(), Some(&test_loader()));
    old.verifier().wait_for_tasks();
    assert_eq!(cache.occupancy(), 1);

    // A runtime booted from a different image must not trust the sidecar.
    let new = memory_pipeline(
        StaticResolver::new("ctx"),
        cache.clone(),
        RecordingHost::new(),
        RuntimeConfig::new("fp-new"),
    );
    let outcome = new.load_in_memory(mods.clone(), Some(&test_loader()));
    assert!(outcome.artifact.is_none());

    // The rejected load queued a fresh verification; once that finishes
    // the rewritten sidecar is usable again.
    new.verifier().wait_for_tasks();
    let healed = new.load_in_memory(mods, Some(&test_loader()));
    assert!(healed.artifact.is_some());
}

#[test]
fn test_context_change_forces_reverification() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = SidecarCache::at(dir.path());
    let mods: Vec<Arc<ModuleImage>> = vec![module("mem-c", 0x41, &["La;"])];

    let writer = memory_pipeline(
        StaticResolver::new("ctx-a"),
        cache.clone(),
        RecordingHost::new(),
        RuntimeConfig::new("fp"),
    );
    writer.load_in_memory(mods.clone(), Some(&test_loader()));
    writer.verifier().wait_for_tasks();

    // The same modules under a different loader chain cannot reuse the
    // recorded results.
    let reader = memory_pipeline(
        StaticResolver::new("ctx-b"),
        cache.clone(),
        RecordingHost::new(),
        RuntimeConfig::new("fp"),
    );
    let outcome = reader.load_in_memory(mods, Some(&test_loader()));
    assert!(outcome.artifact.is_none());
}

#[test]
fn test_corrupt_sidecar_is_replaced_by_reverification() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = SidecarCache::at(dir.path());
    let host = RecordingHost::new();
    let pipeline = memory_pipeline(
        StaticResolver::new("ctx"),
        cache.clone(),
        host.clone(),
        RuntimeConfig::new("fp"),
    );

    let mods: Vec<Arc<ModuleImage>> = vec![module("mem-d", 0x51, &["La;"])];
    let key = cache.key_for(&mods);
    fs::create_dir_all(cache.dir()).unwrap();
    fs::write(key.sidecar_path(), b"not a sidecar").unwrap();

    let outcome = pipeline.load_in_memory(mods.clone(), Some(&test_loader()));
    assert!(outcome.artifact.is_none());

    pipeline.verifier().wait_for_tasks();
    assert_eq!(host.call_count(), 1);
    let healed = pipeline.load_in_memory(mods, Some(&test_loader()));
    assert!(healed.artifact.is_some());
}

#[test]
fn test_debuggable_runtime_never_populates_the_cache() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = SidecarCache::at(dir.path());
    let host = RecordingHost::new();
    let pipeline = memory_pipeline(
        StaticResolver::new("ctx"),
        cache.clone(),
        host.clone(),
        RuntimeConfig::debuggable("fp"),
    );

    let outcome =
        pipeline.load_in_memory(vec![module("mem-e", 0x61, &["La;"])], Some(&test_loader()));
    assert!(outcome.artifact.is_none());

    pipeline.verifier().wait_for_tasks();
    assert_eq!(host.call_count(), 0);
    assert_eq!(cache.occupancy(), 0);
}

#[test]
fn test_load_without_loader_stays_unbacked_and_schedules_nothing() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cache = SidecarCache::at(dir.path());
    let host = RecordingHost::new();
    let pipeline = memory_pipeline(
        StaticResolver::new("ctx"),
        cache.clone(),
        host.clone(),
        RuntimeConfig::new("fp"),
    );

    let outcome = pipeline.load_in_memory(vec![module("mem-f", 0x71, &["La;"])], None);
    assert!(outcome.artifact.is_none());
    assert_eq!(outcome.modules.len(), 1);

    pipeline.verifier().wait_for_tasks();
    assert_eq!(host.call_count(), 0);
    assert_eq!(cache.occupancy(), 0);
}
