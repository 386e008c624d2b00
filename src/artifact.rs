//! Artifact and module data model.
//!
//! A [`ModuleImage`] is one opened bytecode compilation unit; an
//! [`Artifact`] is an opened compiled container holding one or more of
//! them. Artifacts are identified by the base address of their mapping,
//! which is process-unique while the artifact stays open. Consumers share
//! both through `Arc`; identity is always pointer identity, never
//! structural equality.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Separator between a container path and an inner entry name in module
/// locations, as in `app.pack!classes2.mod`.
pub const MULTI_ENTRY_SEPARATOR: char = '!';

/// The container part of a module location: everything before the first
/// multi-entry separator. Single-entry locations are their own base.
pub fn base_location_of(location: &str) -> &str {
    match location.find(MULTI_ENTRY_SEPARATOR) {
        Some(pos) => &location[..pos],
        None => location,
    }
}

/// One bytecode compilation unit, opened from a file or from memory.
///
/// The module carries its full type table (every descriptor it references,
/// lexicographically sorted as the binary format stores it) plus the subset
/// of table indices whose classes the module actually defines. Walking the
/// defined set in ascending index order therefore yields descriptors in
/// ascending byte order, which is what the collision merge relies on.
pub struct ModuleImage {
    location: String,
    checksum: u32,
    type_table: Vec<Arc<str>>,
    defined: Vec<u32>,
}

impl ModuleImage {
    /// Build a module whose listed descriptors are all defined classes.
    /// The type table becomes the sorted, deduplicated descriptor list.
    pub fn new<I, S>(location: impl Into<String>, checksum: u32, classes: I) -> ModuleImage
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table: Vec<Arc<str>> = classes
            .into_iter()
            .map(|d| Arc::from(d.as_ref()))
            .collect();
        table.sort();
        table.dedup();
        let defined = (0..table.len() as u32).collect();
        ModuleImage {
            location: location.into(),
            checksum,
            type_table: table,
            defined,
        }
    }

    /// Build a module with an explicit type table and defined subset.
    ///
    /// `type_table` must already be sorted the way the binary format stores
    /// it; `defined` holds indices into it and is normalized here.
    pub fn with_type_table(
        location: impl Into<String>,
        checksum: u32,
        type_table: Vec<String>,
        mut defined: Vec<u32>,
    ) -> ModuleImage {
        debug_assert!(
            type_table.windows(2).all(|w| w[0] <= w[1]),
            "type table must be sorted"
        );
        defined.sort_unstable();
        defined.dedup();
        defined.retain(|&i| (i as usize) < type_table.len());
        ModuleImage {
            location: location.into(),
            checksum,
            type_table: type_table.into_iter().map(Arc::from).collect(),
            defined,
        }
    }

    /// Full location, including any multi-entry suffix.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Location with any multi-entry suffix stripped.
    pub fn base_location(&self) -> &str {
        base_location_of(&self.location)
    }

    /// Header checksum of the module.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Number of classes the module defines.
    pub fn defined_count(&self) -> usize {
        self.defined.len()
    }

    /// Descriptor of the `pos`-th defined class, ascending byte order.
    pub fn defined_descriptor(&self, pos: usize) -> Option<&Arc<str>> {
        self.defined
            .get(pos)
            .map(|&idx| &self.type_table[idx as usize])
    }

    /// All defined-class descriptors in ascending byte order.
    pub fn defined_descriptors(&self) -> impl Iterator<Item = &str> {
        self.defined
            .iter()
            .map(|&idx| self.type_table[idx as usize].as_ref())
    }
}

impl fmt::Debug for ModuleImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleImage")
            .field("location", &self.location)
            .field("checksum", &self.checksum)
            .field("types", &self.type_table.len())
            .field("defined", &self.defined.len())
            .finish()
    }
}

/// Where an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Part of the platform's base image set, registered at startup.
    BootImage,
    /// Compiled for an application, registered at load time.
    Application,
}

/// Degree of optimization an artifact was compiled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompileFilter {
    AssumeVerified,
    Verify,
    Speed,
    Everything,
}

impl fmt::Display for CompileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompileFilter::AssumeVerified => "assume-verified",
            CompileFilter::Verify => "verify",
            CompileFilter::Speed => "speed",
            CompileFilter::Everything => "everything",
        };
        f.write_str(name)
    }
}

/// Base addresses handed to sidecar-backed artifacts, which have no real
/// mapping of their own. Starts above zero so no synthetic artifact ever
/// claims the null page; stepped by a page so synthetic ranges never touch.
static NEXT_SYNTHETIC_BASE: AtomicUsize = AtomicUsize::new(0x1000);

/// An opened compiled-artifact container.
///
/// All fields are fixed at construction. The registry owns the canonical
/// reference after registration; everyone else holds `Arc` clones.
pub struct Artifact {
    location: String,
    begin: usize,
    size: usize,
    executable: bool,
    origin: Origin,
    compile_filter: CompileFilter,
    context_signature: String,
    modules: Vec<Arc<ModuleImage>>,
}

impl Artifact {
    /// An artifact opened from a compiled container file.
    ///
    /// # Arguments
    /// * `location` - container path
    /// * `begin`, `size` - mapped region; `begin` is the identity key
    /// * `executable` - whether the container holds runnable compiled code
    /// * `compile_filter` - optimization degree recorded at compile time
    /// * `context_signature` - classpath-context signature recorded at
    ///   compile time, compared by the context collaborator
    /// * `modules` - the modules the container carries
    pub fn new(
        location: impl Into<String>,
        begin: usize,
        size: usize,
        executable: bool,
        compile_filter: CompileFilter,
        context_signature: impl Into<String>,
        modules: Vec<Arc<ModuleImage>>,
    ) -> Artifact {
        Artifact {
            location: location.into(),
            begin,
            size,
            executable,
            origin: Origin::Application,
            compile_filter,
            context_signature: context_signature.into(),
            modules,
        }
    }

    /// A non-executable artifact synthesized from a validated verification
    /// sidecar. It backs in-memory modules with cached verification results
    /// and never carries compiled code.
    pub fn from_sidecar(
        location: impl Into<String>,
        modules: Vec<Arc<ModuleImage>>,
        context_signature: impl Into<String>,
    ) -> Artifact {
        let begin = NEXT_SYNTHETIC_BASE.fetch_add(0x1000, Ordering::Relaxed);
        Artifact {
            location: location.into(),
            begin,
            size: 0,
            executable: false,
            origin: Origin::Application,
            compile_filter: CompileFilter::Verify,
            context_signature: context_signature.into(),
            modules,
        }
    }

    /// Same artifact with a different origin tag.
    pub fn with_origin(mut self, origin: Origin) -> Artifact {
        self.origin = origin;
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Base address of the mapping; process-unique while open.
    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_boot(&self) -> bool {
        self.origin == Origin::BootImage
    }

    pub fn compile_filter(&self) -> CompileFilter {
        self.compile_filter
    }

    /// Signature of the classpath context the artifact was compiled
    /// against. Opaque here; only the context collaborator interprets it.
    pub fn context_signature(&self) -> &str {
        &self.context_signature
    }

    pub fn modules(&self) -> &[Arc<ModuleImage>] {
        &self.modules
    }

    /// Whether the container lives under `prefix` (the system partition
    /// check used by the registration policy).
    pub fn is_under(&self, prefix: &Path) -> bool {
        Path::new(&self.location).starts_with(prefix)
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("location", &self.location)
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("executable", &self.executable)
            .field("origin", &self.origin)
            .field("modules", &self.modules.len())
            .finish()
    }
}
