//! Reference-counted shared library loading.
//!
//! The loader keeps one record per normalized library path. Opening a path
//! that is already loaded bumps its reference count and hands out another
//! handle to the same record; the library is unloaded when the last handle
//! is closed, right after the record's unload hooks have run.
//!
//! How a library is actually brought into memory is up to the
//! [`LibraryBackend`]: [`NativeBackend`] uses the OS loader through
//! `libloading`, [`StaticBackend`] serves modules linked into the host.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use libloading::Library;
use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tbx_core::{
    panic_message, PluginExports, Uid, API_VERSION_SYMBOL, CREATE_PLUGIN_SYMBOL,
    DESTROY_PLUGIN_SYMBOL,
};
use tracing::{debug, error, trace, warn};

use crate::error::LoaderError;

type UnloadHook = Box<dyn FnOnce() + Send>;

/// Brings libraries into memory.
pub trait LibraryBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn OpenLibrary>, LoaderError>;
}

/// A library held in memory by a backend. Dropping it unloads the library.
pub trait OpenLibrary: Send + Sync {
    /// Address of an exported symbol, or `None` if it is not exported.
    fn symbol(&self, name: &str) -> Option<*const c_void>;
}

/// A reference to an open library.
///
/// Every handle returned by [`SharedLibraryLoader::open`] must be given
/// back to [`SharedLibraryLoader::close`]. Handles are not `Clone`: open
/// the path again for another reference.
#[derive(Debug, PartialEq, Eq)]
pub struct LibraryHandle {
    id: Uid,
    path: PathBuf,
}

impl LibraryHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> Uid {
        self.id
    }
}

struct LibraryRecord {
    id: Uid,
    library: Box<dyn OpenLibrary>,
    refs: AtomicUsize,
    hooks: Vec<UnloadHook>,
}

/// Process-wide table of loaded libraries.
pub struct SharedLibraryLoader {
    backend: Arc<dyn LibraryBackend>,
    libraries: DashMap<PathBuf, LibraryRecord>,
}

impl std::fmt::Debug for SharedLibraryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLibraryLoader")
            .field("loaded", &self.libraries.len())
            .finish()
    }
}

impl Default for SharedLibraryLoader {
    fn default() -> Self {
        Self::native()
    }
}

impl SharedLibraryLoader {
    pub fn new(backend: Arc<dyn LibraryBackend>) -> Self {
        Self {
            backend,
            libraries: DashMap::new(),
        }
    }

    /// A loader backed by the operating system's dynamic loader.
    pub fn native() -> Self {
        Self::new(Arc::new(NativeBackend))
    }

    /// Opens `path`, or takes another reference if it is already open.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<LibraryHandle, LoaderError> {
        let path = normalize(path.as_ref());

        let (id, refs) = match self.libraries.entry(path.clone()) {
            Entry::Occupied(entry) => {
                let record = entry.get();
                let refs = record.refs.fetch_add(1, Ordering::AcqRel) + 1;
                (record.id, refs)
            }
            Entry::Vacant(entry) => {
                let library = self.backend.open(&path)?;
                let id = Uid::new();
                entry.insert(LibraryRecord {
                    id,
                    library,
                    refs: AtomicUsize::new(1),
                    hooks: Vec::new(),
                });
                (id, 1)
            }
        };

        if refs == 1 {
            debug!("Loaded library {}", path.display());
        } else {
            trace!("Library {} now has {} references", path.display(), refs);
        }
        Ok(LibraryHandle { id, path })
    }

    /// Looks up an exported symbol. Returns `None` if the symbol is not
    /// exported or the handle no longer refers to a loaded library.
    pub fn symbol(&self, handle: &LibraryHandle, name: &str) -> Option<*const c_void> {
        let record = self.libraries.get(&handle.path)?;
        if record.id != handle.id {
            return None;
        }
        record.library.symbol(name)
    }

    /// Registers `hook` to run right before the library behind `handle` is
    /// unloaded. Returns `false` if the handle is stale.
    pub fn on_before_unload(
        &self,
        handle: &LibraryHandle,
        hook: impl FnOnce() + Send + 'static,
    ) -> bool {
        match self.libraries.get_mut(&handle.path) {
            Some(mut record) if record.id == handle.id => {
                record.hooks.push(Box::new(hook));
                true
            }
            _ => false,
        }
    }

    /// Gives back a reference. The last one runs the unload hooks and then
    /// unloads the library.
    ///
    /// Returns `false` if `handle` is stale: its library was already
    /// unloaded, possibly reopened since under a new id.
    pub fn close(&self, handle: LibraryHandle) -> bool {
        let removed = self.libraries.remove_if(&handle.path, |_, record| {
            record.id == handle.id && record.refs.fetch_sub(1, Ordering::AcqRel) == 1
        });

        if let Some((path, record)) = removed {
            Self::unload(&path, record);
            return true;
        }

        let live = self
            .libraries
            .get(&handle.path)
            .is_some_and(|record| record.id == handle.id);
        if live {
            trace!("Released a reference to {}", handle.path.display());
        } else {
            warn!("Closed stale library handle for {}", handle.path.display());
        }
        live
    }

    /// Current reference count of the library behind `handle`.
    pub fn refcount(&self, handle: &LibraryHandle) -> usize {
        self.libraries
            .get(&handle.path)
            .filter(|record| record.id == handle.id)
            .map_or(0, |record| record.refs.load(Ordering::Acquire))
    }

    pub fn is_loaded(&self, path: impl AsRef<Path>) -> bool {
        self.libraries.contains_key(&normalize(path.as_ref()))
    }

    /// Number of distinct libraries currently loaded.
    pub fn loaded_count(&self) -> usize {
        self.libraries.len()
    }

    fn unload(path: &Path, record: LibraryRecord) {
        let LibraryRecord { library, hooks, .. } = record;
        for hook in hooks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
                error!(
                    "Unload hook for {} panicked: {}",
                    path.display(),
                    panic_message(payload.as_ref())
                );
            }
        }
        drop(library);
        debug!("Unloaded library {}", path.display());
    }
}

impl Drop for SharedLibraryLoader {
    fn drop(&mut self) {
        let leaked: Vec<PathBuf> = self.libraries.iter().map(|e| e.key().clone()).collect();
        for path in leaked {
            if let Some((path, record)) = self.libraries.remove(&path) {
                warn!(
                    "Library {} still had {} references when the loader was dropped",
                    path.display(),
                    record.refs.load(Ordering::Acquire)
                );
                Self::unload(&path, record);
            }
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Platform file name for a library called `lib`.
///
/// Names that already carry an extension are returned unchanged.
pub fn library_filename(lib: &str) -> String {
    if Path::new(lib).extension().is_some() {
        return lib.to_string();
    }
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        lib,
        std::env::consts::DLL_SUFFIX
    )
}

// ============================================================================
// Native backend
// ============================================================================

/// Loads libraries with `dlopen`/`LoadLibrary` through `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

struct NativeLibrary {
    library: Library,
}

impl LibraryBackend for NativeBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn OpenLibrary>, LoaderError> {
        // SAFETY: loading runs the library's initializers. Plugin libraries
        // are trusted code built against this host.
        let library = unsafe { Library::new(path) }.map_err(|e| LoaderError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(NativeLibrary { library }))
    }
}

impl OpenLibrary for NativeLibrary {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the address is only handed out as an untyped pointer;
        // callers cast it to the signature they expect.
        let symbol = unsafe { self.library.get::<unsafe extern "C" fn()>(name.as_bytes()) }.ok()?;
        Some(*symbol as *const c_void)
    }
}

// ============================================================================
// Static backend
// ============================================================================

/// The exported symbols of a module linked into the host.
#[derive(Debug, Clone, Default)]
pub struct StaticModule {
    symbols: HashMap<String, usize>,
}

impl StaticModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, name: impl Into<String>, address: *const c_void) -> Self {
        self.symbols.insert(name.into(), address as usize);
        self
    }

    /// A module exporting the three plugin entry points.
    pub fn from_exports(exports: PluginExports) -> Self {
        Self::new()
            .with_symbol(CREATE_PLUGIN_SYMBOL, exports.create as *const c_void)
            .with_symbol(DESTROY_PLUGIN_SYMBOL, exports.destroy as *const c_void)
            .with_symbol(API_VERSION_SYMBOL, exports.api_version as *const c_void)
    }
}

struct StaticEntry {
    module: StaticModule,
    live: Arc<AtomicUsize>,
}

/// Serves modules registered in-process, keyed by library file name.
///
/// Paths whose file name has no registered module go to the fallback
/// backend, if one is set.
#[derive(Default)]
pub struct StaticBackend {
    modules: DashMap<String, StaticEntry>,
    fallback: Option<Arc<dyn LibraryBackend>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn LibraryBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Registers `module` under the library file name `name`.
    pub fn register(&self, name: impl Into<String>, module: StaticModule) {
        self.modules.insert(
            name.into(),
            StaticEntry {
                module,
                live: Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    /// How many times the module `name` is currently open.
    pub fn live_instances(&self, name: &str) -> usize {
        self.modules
            .get(name)
            .map_or(0, |entry| entry.live.load(Ordering::Acquire))
    }
}

struct StaticLibrary {
    symbols: HashMap<String, usize>,
    live: Arc<AtomicUsize>,
}

impl LibraryBackend for StaticBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn OpenLibrary>, LoaderError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(entry) = self.modules.get(&name) {
            entry.live.fetch_add(1, Ordering::AcqRel);
            return Ok(Box::new(StaticLibrary {
                symbols: entry.module.symbols.clone(),
                live: entry.live.clone(),
            }));
        }

        match &self.fallback {
            Some(fallback) => fallback.open(path),
            None => Err(LoaderError::Open {
                path: path.to_path_buf(),
                reason: format!("no static module registered as '{}'", name),
            }),
        }
    }
}

impl OpenLibrary for StaticLibrary {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.symbols.get(name).map(|address| *address as *const c_void)
    }
}

impl Drop for StaticLibrary {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
