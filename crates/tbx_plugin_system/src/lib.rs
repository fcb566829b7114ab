//! # Tbx Plugin System
//!
//! Host-side plugin management: a reference-counted shared library loader,
//! JSON plugin manifests, directory discovery with dependency ordering, and
//! the [`PluginServer`] that owns every loaded plugin.
//!
//! ## Layout on disk
//!
//! ```text
//! plugins/
//!     Logger/
//!         Logger.manifest
//!         libLogger.so
//!     Sandbox/
//!         Sandbox.manifest
//!         libSandbox.so
//! ```
//!
//! ## Lifecycle
//!
//! [`PluginServer::initialize`] constructs every plugin, moves loggers to
//! the front and calls `on_load` in that order. [`PluginServer::shutdown`]
//! walks the registry backwards: `on_unload`, subscriptions released, the
//! object handed back to its module's `destroy_plugin`, and finally the
//! library closed.
//!
//! Plugins linked into the host are served by the [`StaticBackend`], which
//! goes through the same loader code as native libraries.

pub mod discovery;
pub mod error;
pub mod library;
pub mod manifest;
pub mod server;

pub use discovery::{discover, filter_requested, plan_load_order, prefer_loggers, LoadPlan};
pub use error::{LoaderError, ManifestError, ServerError};
pub use library::{
    library_filename, LibraryBackend, LibraryHandle, NativeBackend, OpenLibrary,
    SharedLibraryLoader, StaticBackend, StaticModule,
};
pub use manifest::{PluginManifest, DEFAULT_PRIORITY, MANIFEST_EXTENSION};
pub use server::{LoadedPlugin, PluginRef, PluginServer};
