//! Per-plugin handle onto the host.

use crate::bus::{EventBus, Subscription};
use crate::event::Event;
use crate::hashing::{type_key, CallbackKey};
use crate::log::LogLevel;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Host-side log callback: `(level, plugin name, message)`.
pub type LogSink = Arc<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

/// What a plugin gets to talk to the host with.
///
/// Subscriptions made through the context are remembered and removed from
/// the bus when the plugin is unloaded. Their closures live in the plugin's
/// module, so they must be gone before that module is unloaded.
pub struct PluginContext {
    name: String,
    version: String,
    directory: PathBuf,
    bus: Arc<EventBus>,
    log_sink: LogSink,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("directory", &self.directory)
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

impl PluginContext {
    /// Creates a context whose log output goes to `tracing` in the calling
    /// module.
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            directory: PathBuf::new(),
            bus,
            log_sink: Arc::new(trace_sink),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Directory the plugin was loaded from. Useful for plugin-local assets.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        (self.log_sink)(level, &self.name, message.as_ref());
    }

    /// Subscribes a closure and records the subscription.
    pub fn subscribe<E, F>(&self, callback: F) -> CallbackKey
    where
        E: Event,
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        let key = self.bus.subscribe::<E, F>(callback);
        self.record::<E>(key);
        key
    }

    /// Subscribes a free function and records the subscription.
    pub fn subscribe_fn<E: Event>(&self, callback: fn(&mut E)) -> CallbackKey {
        let key = self.bus.subscribe_fn(callback);
        self.record::<E>(key);
        key
    }

    /// Subscribes a method bound to `instance` and records the subscription.
    pub fn subscribe_method<E, T>(&self, instance: &Arc<T>, method: fn(&T, &mut E)) -> CallbackKey
    where
        E: Event,
        T: Send + Sync + 'static,
    {
        let key = self.bus.subscribe_method(instance, method);
        self.record::<E>(key);
        key
    }

    pub fn unsubscribe<E: Event>(&self, key: CallbackKey) {
        let subscription = Subscription {
            event: type_key::<E>(),
            callback: key,
        };
        self.subscriptions.lock().retain(|s| *s != subscription);
        self.bus.unsubscribe::<E>(key);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Removes every subscription made through this context. Returns how many
    /// were still registered on the bus.
    pub fn release_subscriptions(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        subscriptions
            .into_iter()
            .filter(|s| self.bus.remove_subscription(*s))
            .count()
    }

    fn record<E: Event>(&self, key: CallbackKey) {
        let subscription = Subscription {
            event: type_key::<E>(),
            callback: key,
        };
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.contains(&subscription) {
            subscriptions.push(subscription);
        }
    }
}

fn trace_sink(level: LogLevel, plugin: &str, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(plugin, "{}", message),
        LogLevel::Warn => tracing::warn!(plugin, "{}", message),
        LogLevel::Info => tracing::info!(plugin, "{}", message),
        LogLevel::Debug => tracing::debug!(plugin, "{}", message),
        LogLevel::Trace => tracing::trace!(plugin, "{}", message),
    }
}
