//! Duplicate-class detection between loaded modules and a candidate
//! artifact.
//!
//! When two class loaders expose the same descriptor from different
//! modules, compiled code that resolved the class at build time may
//! disagree with what the runtime resolves now. Before an artifact may
//! back a load, its classes are merged against everything the loader
//! chain already exposes:
//!
//! ```text
//!   loaded modules   candidate modules
//!        │                  │
//!        ▼                  ▼
//!   per-module symbol cursors (sorted descriptors)
//!        │                  │
//!        └───────┬──────────┘
//!                ▼
//!        min-heap k-way merge
//!                ▼
//!    equal-descriptor groups ── collision iff the group spans
//!                               both provenances
//! ```
//!
//! Cursors are index positions into their module's defined-class set, so
//! the merge never holds interior pointers into module storage. Each heap
//! entry owns its current descriptor plus the cursor's slot index; ties
//! break on the slot, giving the heap a strict total order and the report
//! a deterministic shape.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;
use tracing::debug;

use crate::artifact::{Artifact, ModuleImage};
use crate::context::{ClasspathContext, SignatureMatch};

/// Which side of the merge a module came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Already visible through the class-loader chain.
    Loaded,
    /// Carried by the candidate artifact under scrutiny.
    Candidate,
}

/// Ordered walk over one module's defined classes.
struct SymbolCursor {
    module: Arc<ModuleImage>,
    pos: usize,
}

impl SymbolCursor {
    fn new(module: Arc<ModuleImage>) -> SymbolCursor {
        SymbolCursor { module, pos: 0 }
    }

    fn current(&self) -> Option<Arc<str>> {
        self.module.defined_descriptor(self.pos).cloned()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

struct MergeSource {
    cursor: SymbolCursor,
    provenance: Provenance,
}

/// Heap entry: the descriptor a cursor currently points at, plus the
/// cursor's slot in the source list as a tie-break.
struct HeapEntry {
    descriptor: Arc<str>,
    slot: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.descriptor
            .as_ref()
            .cmp(other.descriptor.as_ref())
            .then(self.slot.cmp(&other.slot))
    }
}

/// One class defined both by a loaded module and by the candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateClass {
    pub descriptor: Arc<str>,
    /// Module on the already-loaded side defining the class.
    pub loaded_location: String,
    /// Candidate-side module defining the same class.
    pub candidate_location: String,
}

/// Every duplicate found by one merge run, in ascending descriptor order.
#[derive(Debug, Default)]
pub struct CollisionReport {
    duplicates: Vec<DuplicateClass>,
}

impl CollisionReport {
    pub fn has_collisions(&self) -> bool {
        !self.duplicates.is_empty()
    }

    pub fn duplicates(&self) -> &[DuplicateClass] {
        &self.duplicates
    }
}

impl fmt::Display for CollisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self
            .duplicates
            .iter()
            .map(|d| {
                format!(
                    "duplicate class {} in {} (loaded) and {} (candidate)",
                    d.descriptor, d.loaded_location, d.candidate_location
                )
            })
            .join("\n");
        f.write_str(&lines)
    }
}

/// Outcome of vetting one candidate artifact against a loader chain.
#[derive(Debug)]
pub enum CollisionCheck {
    /// The live context matches the recorded signature; the merge was
    /// skipped because compile-time resolution still holds.
    ContextVerified,
    /// The recorded signature carries the shared-library marker; checks
    /// were skipped at the compiler's request.
    SkippedSharedLibrary,
    /// The chain topology is unsupported; acceptance is optimistic and
    /// unchecked.
    SkippedUnsupportedLoader,
    /// The merge ran and found no duplicates.
    NoCollisions,
    /// The merge ran and found duplicates.
    HasCollisions(CollisionReport),
}

impl CollisionCheck {
    /// Whether the candidate may back the load. Only an actual collision
    /// refuses; every skip variant accepts.
    pub fn accepts(&self) -> bool {
        !matches!(self, CollisionCheck::HasCollisions(_))
    }
}

/// Merge the defined classes of both sides and report every descriptor
/// that appears under both provenances.
///
/// Repeats within one side never count: sibling entries of a multi-entry
/// container legitimately define the same descriptor. Modules without
/// defined classes are skipped entirely.
pub fn find_duplicate_classes(
    loaded: &[Arc<ModuleImage>],
    candidate: &[Arc<ModuleImage>],
) -> CollisionReport {
    let mut sources: Vec<MergeSource> = Vec::with_capacity(loaded.len() + candidate.len());
    for module in loaded {
        if module.defined_count() > 0 {
            sources.push(MergeSource {
                cursor: SymbolCursor::new(module.clone()),
                provenance: Provenance::Loaded,
            });
        }
    }
    for module in candidate {
        if module.defined_count() > 0 {
            sources.push(MergeSource {
                cursor: SymbolCursor::new(module.clone()),
                provenance: Provenance::Candidate,
            });
        }
    }

    let mut heap: BinaryHeap<Reverse<HeapEntry>> = sources
        .iter()
        .enumerate()
        .filter_map(|(slot, source)| {
            source
                .cursor
                .current()
                .map(|descriptor| Reverse(HeapEntry { descriptor, slot }))
        })
        .collect();

    let mut duplicates = Vec::new();
    let mut group: SmallVec<[usize; 4]> = SmallVec::new();

    while let Some(Reverse(head)) = heap.pop() {
        group.clear();
        group.push(head.slot);

        // Drain every source currently sitting on the same descriptor.
        loop {
            match heap.peek() {
                Some(Reverse(next)) if next.descriptor == head.descriptor => {
                    if let Some(Reverse(entry)) = heap.pop() {
                        group.push(entry.slot);
                    }
                }
                _ => break,
            }
        }

        if group.len() > 1 {
            let loaded_slot = group
                .iter()
                .copied()
                .find(|&slot| sources[slot].provenance == Provenance::Loaded);
            let candidate_slot = group
                .iter()
                .copied()
                .find(|&slot| sources[slot].provenance == Provenance::Candidate);
            if let (Some(l), Some(c)) = (loaded_slot, candidate_slot) {
                duplicates.push(DuplicateClass {
                    descriptor: head.descriptor.clone(),
                    loaded_location: sources[l].cursor.module.location().to_string(),
                    candidate_location: sources[c].cursor.module.location().to_string(),
                });
            }
        }

        for &slot in &group {
            let source = &mut sources[slot];
            source.cursor.advance();
            if let Some(descriptor) = source.cursor.current() {
                heap.push(Reverse(HeapEntry { descriptor, slot }));
            }
        }
    }

    CollisionReport { duplicates }
}

/// Vet `candidate` against the loader chain behind `context`.
///
/// The merge only runs when the context comparison demands it; a matching
/// signature proves compile-time resolution still holds, and the
/// shared-library marker means the compiler opted out of checks entirely.
pub fn check_artifact_collision(
    candidate: &Artifact,
    context: Option<&dyn ClasspathContext>,
) -> CollisionCheck {
    let Some(context) = context else {
        debug!(
            artifact = candidate.location(),
            "Collision check skipped: unsupported or missing loader chain"
        );
        return CollisionCheck::SkippedUnsupportedLoader;
    };

    match context.compare_signature(candidate.context_signature()) {
        SignatureMatch::Matches => {
            debug!(
                artifact = candidate.location(),
                "Collision check skipped: context matches recorded signature"
            );
            CollisionCheck::ContextVerified
        }
        SignatureMatch::ForceSkip => {
            debug!(
                artifact = candidate.location(),
                "Collision check skipped: shared-library context"
            );
            CollisionCheck::SkippedSharedLibrary
        }
        SignatureMatch::Mismatch => {
            let loaded = context.flattened_loaded_modules();
            let report = find_duplicate_classes(&loaded, candidate.modules());
            if report.has_collisions() {
                CollisionCheck::HasCollisions(report)
            } else {
                CollisionCheck::NoCollisions
            }
        }
    }
}
