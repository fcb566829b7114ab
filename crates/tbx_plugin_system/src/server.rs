//! The plugin server: discovers, loads, queries and unloads plugins.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tbx_core::{
    AppPlugin, AppSettings, ApiVersionFn, Capability, CreatePluginFn, DestroyPluginFn, EventBus,
    FrameContext, Layer, LogLevel, LogMessageEvent, LoggerPlugin, Plugin, PluginContext,
    PluginError, PluginExports, PluginLoadedEvent, PluginUnloadedEvent, API_VERSION_SYMBOL,
    CREATE_PLUGIN_SYMBOL, DESTROY_PLUGIN_SYMBOL, PLUGIN_API_VERSION,
};
use tracing::{debug, error, info, warn};

use crate::discovery::{discover, filter_requested, plan_load_order, prefer_loggers, same_name};
use crate::error::ServerError;
use crate::library::{library_filename, LibraryHandle, SharedLibraryLoader};
use crate::manifest::PluginManifest;

// ============================================================================
// Loaded plugins
// ============================================================================

/// A plugin object allocated by its module, plus the module's destructor.
struct PluginAllocation {
    instance: NonNull<dyn Plugin>,
    destroy: DestroyPluginFn,
}

// SAFETY: the allocation is only touched by the unload hook, after every
// reference to the plugin object is gone. `Plugin` itself is Send + Sync.
unsafe impl Send for PluginAllocation {}

impl PluginAllocation {
    fn release(self) {
        // SAFETY: `instance` came from the same module's `create_plugin` and
        // is released exactly once, here.
        unsafe { (self.destroy)(self.instance.as_ptr()) }
    }
}

/// A plugin in the registry.
///
/// Dropping the last reference removes the plugin's remaining
/// subscriptions and closes its library, which destroys the plugin object
/// right before the library is unloaded.
pub struct LoadedPlugin {
    manifest: PluginManifest,
    instance: NonNull<dyn Plugin>,
    context: Arc<PluginContext>,
    library: Option<LibraryHandle>,
    loader: Arc<SharedLibraryLoader>,
    unloaded: AtomicBool,
}

// SAFETY: the plugin object is Send + Sync and outlives every `LoadedPlugin`
// reference; it is only destroyed from `Drop`.
unsafe impl Send for LoadedPlugin {}
unsafe impl Sync for LoadedPlugin {}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("unloaded", &self.unloaded.load(Ordering::Acquire))
            .finish()
    }
}

impl LoadedPlugin {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn context(&self) -> &Arc<PluginContext> {
        &self.context
    }

    pub fn plugin(&self) -> &dyn Plugin {
        // SAFETY: the object is alive until `Drop` closes the library.
        unsafe { self.instance.as_ref() }
    }

    /// Whether `on_unload` has already run.
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    fn load(&self) -> Result<(), PluginError> {
        catch_unwind(AssertUnwindSafe(|| self.plugin().on_load(&self.context)))
            .unwrap_or_else(|payload| Err(PluginError::from_panic(payload)))
    }

    /// Runs `on_unload` once and drops the plugin's subscriptions.
    fn unload(&self) -> Result<(), PluginError> {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = catch_unwind(AssertUnwindSafe(|| self.plugin().on_unload(&self.context)))
            .unwrap_or_else(|payload| Err(PluginError::from_panic(payload)));
        let released = self.context.release_subscriptions();
        if released > 0 {
            debug!("Released {} subscriptions of plugin {}", released, self.name());
        }
        result
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        self.context.release_subscriptions();
        if let Some(library) = self.library.take() {
            self.loader.close(library);
        }
    }
}

// ============================================================================
// Capability handles
// ============================================================================

/// A shared handle to one capability of a loaded plugin.
///
/// The handle keeps the plugin (and its library) alive, so holding one past
/// [`PluginServer::shutdown`] delays the plugin's destruction until the
/// handle is dropped.
pub struct PluginRef<T: ?Sized + Capability> {
    plugin: Arc<LoadedPlugin>,
    target: NonNull<T>,
}

// SAFETY: `T` is Send + Sync by the `Capability` bound, and the target lives
// as long as `plugin`.
unsafe impl<T: ?Sized + Capability> Send for PluginRef<T> {}
unsafe impl<T: ?Sized + Capability> Sync for PluginRef<T> {}

impl<T: ?Sized + Capability> PluginRef<T> {
    /// Queries `plugin` for the capability `T`.
    pub fn new(plugin: Arc<LoadedPlugin>) -> Option<Self> {
        let target = NonNull::from(T::query(plugin.plugin())?);
        Some(Self { plugin, target })
    }

    /// Name of the plugin offering the capability.
    pub fn plugin_name(&self) -> &str {
        self.plugin.name()
    }

    pub fn loaded(&self) -> &Arc<LoadedPlugin> {
        &self.plugin
    }
}

impl<T: ?Sized + Capability> Clone for PluginRef<T> {
    fn clone(&self) -> Self {
        Self {
            plugin: self.plugin.clone(),
            target: self.target,
        }
    }
}

impl<T: ?Sized + Capability> std::ops::Deref for PluginRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the target points into the plugin object held by `plugin`.
        unsafe { self.target.as_ref() }
    }
}

impl<T: ?Sized + Capability> std::fmt::Debug for PluginRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PluginRef<{}>({})", T::NAME, self.plugin_name())
    }
}

impl LoggerPlugin for PluginRef<dyn LoggerPlugin> {
    fn write(&self, record: &LogMessageEvent) {
        (**self).write(record)
    }

    fn max_level(&self) -> LogLevel {
        (**self).max_level()
    }

    fn flush(&self) {
        (**self).flush()
    }
}

impl Layer for PluginRef<dyn Layer> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_overlay(&self) -> bool {
        (**self).is_overlay()
    }

    fn on_attach(&self) {
        (**self).on_attach()
    }

    fn on_detach(&self) {
        (**self).on_detach()
    }

    fn on_update(&self, frame: &FrameContext) -> Result<(), PluginError> {
        (**self).on_update(frame)
    }
}

impl AppPlugin for PluginRef<dyn AppPlugin> {
    fn settings(&self) -> AppSettings {
        (**self).settings()
    }

    fn on_launch(&self) -> Result<(), PluginError> {
        (**self).on_launch()
    }

    fn on_update(&self, frame: &FrameContext) -> Result<(), PluginError> {
        (**self).on_update(frame)
    }

    fn on_shutdown(&self) {
        (**self).on_shutdown()
    }
}

// ============================================================================
// Plugin server
// ============================================================================

/// Loads every plugin below a directory and owns them until shutdown.
///
/// The registry is kept in load order: loggers first, then the rest in
/// dependency order. Shutdown walks it backwards.
///
/// ```ignore
/// let mut server = PluginServer::new(EventBus::global());
/// server.initialize("plugins")?;
/// for layer in server.get_all_of_type::<dyn Layer>() {
///     println!("layer {}", layer.name());
/// }
/// server.shutdown();
/// ```
pub struct PluginServer {
    bus: Arc<EventBus>,
    loader: Arc<SharedLibraryLoader>,
    whitelist: Vec<String>,
    directory: Option<PathBuf>,
    registry: Vec<Arc<LoadedPlugin>>,
}

impl std::fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginServer")
            .field("directory", &self.directory)
            .field("plugins", &self.registry)
            .finish()
    }
}

impl PluginServer {
    /// Creates a server loading native libraries.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_loader(bus, Arc::new(SharedLibraryLoader::native()))
    }

    pub fn with_loader(bus: Arc<EventBus>, loader: Arc<SharedLibraryLoader>) -> Self {
        Self {
            bus,
            loader,
            whitelist: Vec::new(),
            directory: None,
            registry: Vec::new(),
        }
    }

    /// Restricts loading to the named plugins and their dependencies.
    pub fn with_whitelist(mut self, whitelist: Vec<String>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn loader(&self) -> &Arc<SharedLibraryLoader> {
        &self.loader
    }

    /// Directory of the last `initialize`.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Loads every plugin found below `directory` and returns how many
    /// were loaded.
    ///
    /// Loading happens in phases: every plugin object is constructed first,
    /// loggers move as far forward as their dependencies allow, then
    /// `on_load` runs in that order. A plugin that fails at any point is
    /// skipped and logged; so are the plugins depending on it.
    pub fn initialize(&mut self, directory: impl AsRef<Path>) -> Result<usize, ServerError> {
        let directory = directory.as_ref();
        if !self.registry.is_empty() {
            return Err(ServerError::AlreadyInitialized(
                self.directory.clone().unwrap_or_default(),
            ));
        }
        self.directory = Some(directory.to_path_buf());

        info!("Loading plugins from {}", directory.display());
        let manifests = filter_requested(discover(directory)?, &self.whitelist);
        let plan = plan_load_order(manifests);

        let mut unavailable: Vec<PluginManifest> = Vec::new();
        for (manifest, missing) in &plan.unresolved {
            let error = ServerError::Discovery(format!(
                "plugin '{}' has unmet dependencies: {}",
                manifest.name,
                missing.join(", ")
            ));
            error!("{}", error);
            unavailable.push(manifest.clone());
        }

        // Phase 1: open libraries and construct plugin objects
        let mut constructed = Vec::with_capacity(plan.ordered.len());
        for manifest in plan.ordered {
            if let Some(dependency) = failed_dependency(&manifest, &unavailable) {
                error!(
                    "Skipping plugin {}: dependency {} is not available",
                    manifest.name, dependency
                );
                unavailable.push(manifest);
                continue;
            }
            let name = manifest.name.clone();
            match self.construct(manifest.clone()) {
                Ok(plugin) => {
                    debug!("Constructed plugin {}", name);
                    constructed.push(plugin);
                }
                Err(e) => {
                    error!("{}", e);
                    unavailable.push(manifest);
                }
            }
        }

        // Phase 2: loggers as early as their dependencies allow, so the
        // others can log from on_load
        let constructed = prefer_loggers(
            constructed,
            |plugin| plugin.manifest(),
            |plugin| plugin.plugin().as_logger().is_some(),
        );

        // Phase 3: on_load
        for plugin in constructed {
            if let Some(dependency) = failed_dependency(plugin.manifest(), &unavailable) {
                error!(
                    "Skipping plugin {}: dependency {} failed to load",
                    plugin.name(),
                    dependency
                );
                unavailable.push(plugin.manifest().clone());
                continue;
            }

            if let Err(source) = plugin.load() {
                let error = ServerError::Initialization {
                    plugin: plugin.name().to_string(),
                    source,
                };
                error!("{}", error);
                unavailable.push(plugin.manifest().clone());
                // on_unload is not owed to a plugin that never loaded
                plugin.unloaded.store(true, Ordering::Release);
                continue;
            }

            let manifest = plugin.manifest();
            info!(
                "Loaded plugin {} v{} by {}: {}",
                manifest.name, manifest.version, manifest.author, manifest.description
            );
            self.bus.send(&mut PluginLoadedEvent::new(
                manifest.name.clone(),
                manifest.version.clone(),
            ));
            self.registry.push(Arc::new(plugin));
        }

        if !unavailable.is_empty() {
            let names: Vec<&str> = unavailable.iter().map(|m| m.name.as_str()).collect();
            warn!("Failed to load {} plugins: {}", names.len(), names.join(", "));
        }
        info!("{} plugins loaded", self.registry.len());
        Ok(self.registry.len())
    }

    /// Unloads every plugin in reverse load order.
    ///
    /// Each plugin gets `on_unload`, loses its subscriptions and is
    /// destroyed before its library closes. Plugins still referenced through
    /// a [`PluginRef`] are destroyed when the last handle drops.
    pub fn shutdown(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        info!("Unloading {} plugins", self.registry.len());

        while let Some(plugin) = self.registry.pop() {
            self.bus
                .send(&mut PluginUnloadedEvent::new(plugin.name().to_string()));
            if let Err(source) = plugin.unload() {
                let error = ServerError::Teardown {
                    plugin: plugin.name().to_string(),
                    source,
                };
                error!("{}", error);
            }
            debug!("Unloaded plugin {}", plugin.name());
        }
    }

    /// Shuts down and loads everything below `directory` again.
    pub fn reload(&mut self, directory: impl AsRef<Path>) -> Result<usize, ServerError> {
        self.shutdown();
        self.initialize(directory)
    }

    /// Every loaded plugin, in load order.
    pub fn get_all(&self) -> &[Arc<LoadedPlugin>] {
        &self.registry
    }

    /// Every loaded plugin offering capability `T`, in load order.
    pub fn get_all_of_type<T: ?Sized + Capability>(&self) -> Vec<PluginRef<T>> {
        self.registry
            .iter()
            .filter_map(|plugin| PluginRef::new(plugin.clone()))
            .collect()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.registry
            .iter()
            .find(|plugin| same_name(plugin.name(), name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn construct(&self, manifest: PluginManifest) -> Result<LoadedPlugin, ServerError> {
        // Static plugins name a module linked into the host, not a file
        let library_path = if manifest.is_static {
            PathBuf::from(library_filename(&manifest.lib))
        } else {
            manifest.library_path()
        };

        let load_error = |reason: String| ServerError::Load {
            plugin: manifest.name.clone(),
            reason,
        };

        let handle = self
            .loader
            .open(&library_path)
            .map_err(|e| load_error(e.to_string()))?;

        let instance = match self.create_instance(&handle) {
            Ok(instance) => instance,
            Err(reason) => {
                self.loader.close(handle);
                return Err(load_error(reason));
            }
        };

        let context = Arc::new(
            PluginContext::new(manifest.name.clone(), self.bus.clone())
                .with_version(manifest.version.clone())
                .with_directory(manifest.root.clone()),
        );

        Ok(LoadedPlugin {
            manifest,
            instance,
            context,
            library: Some(handle),
            loader: self.loader.clone(),
            unloaded: AtomicBool::new(false),
        })
    }

    /// Resolves the entry points, checks the API version and runs the
    /// factory. The object is destroyed by a hook on the library.
    fn create_instance(&self, handle: &LibraryHandle) -> Result<NonNull<dyn Plugin>, String> {
        let exports = self.resolve_exports(handle)?;

        let version = (exports.api_version)();
        if version != PLUGIN_API_VERSION {
            return Err(format!(
                "built against plugin API {}, host provides {}",
                version, PLUGIN_API_VERSION
            ));
        }

        // SAFETY: `create` is the module's own factory.
        let raw = unsafe { (exports.create)() };
        let instance = NonNull::new(raw).ok_or_else(|| "create_plugin returned null".to_string())?;

        let allocation = PluginAllocation {
            instance,
            destroy: exports.destroy,
        };
        if !self
            .loader
            .on_before_unload(handle, move || allocation.release())
        {
            return Err("library was unloaded while the plugin was created".to_string());
        }
        Ok(instance)
    }

    fn resolve_exports(&self, handle: &LibraryHandle) -> Result<PluginExports, String> {
        let symbol = |name: &str| -> Result<*const c_void, String> {
            self.loader
                .symbol(handle, name)
                .ok_or_else(|| format!("missing symbol '{}'", name))
        };

        let create = symbol(CREATE_PLUGIN_SYMBOL)?;
        let destroy = symbol(DESTROY_PLUGIN_SYMBOL)?;
        let api_version = symbol(API_VERSION_SYMBOL)?;

        // SAFETY: these names are only exported by `register_plugin!`, with
        // exactly these signatures.
        unsafe {
            Ok(PluginExports {
                create: std::mem::transmute::<*const c_void, CreatePluginFn>(create),
                destroy: std::mem::transmute::<*const c_void, DestroyPluginFn>(destroy),
                api_version: std::mem::transmute::<*const c_void, ApiVersionFn>(api_version),
            })
        }
    }
}

impl Drop for PluginServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The first dependency of `manifest` met by a plugin that did not load.
fn failed_dependency<'a>(
    manifest: &'a PluginManifest,
    unavailable: &[PluginManifest],
) -> Option<&'a str> {
    manifest
        .dependencies
        .iter()
        .find(|dep| {
            unavailable
                .iter()
                .any(|failed| !same_name(&failed.name, &manifest.name) && failed.provides(dep))
        })
        .map(String::as_str)
}
