//! The host driver: loads the plugins, runs the app and tears everything
//! down again, as many times as the app asks to restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tbx_core::{
    AppPlugin, CallbackKey, EventBus, Layer, LogMessageEvent, LoggerPlugin, PluginUnloadedEvent,
};
use tbx_plugin_system::{PluginRef, PluginServer};
use tracing::{debug, error, info};

use crate::app::{App, AppStatus};
use crate::error::HostError;

/// What the host needs to know to run.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Directory holding one subdirectory per plugin
    pub plugin_directory: PathBuf,
    /// Plugins to load; empty loads everything
    pub whitelist: Vec<String>,
    /// Minimum frame duration unless the app sets its own
    pub frame_interval: Option<Duration>,
    /// How often the app may restart; 0 is unlimited
    pub max_restarts: u32,
}

impl HostConfig {
    pub fn new(plugin_directory: impl Into<PathBuf>) -> Self {
        Self {
            plugin_directory: plugin_directory.into(),
            whitelist: Vec::new(),
            frame_interval: None,
            max_restarts: 0,
        }
    }
}

/// Owns the bus and the plugin server, and drives the app.
///
/// # Lifecycle
///
/// Each cycle of [`Host::run`]:
///
/// 1. Loads every plugin from the configured directory
/// 2. Finds the one app plugin and the logger plugins
/// 3. Builds an [`App`] with every layer plugin pushed onto it and runs it
/// 4. Unloads the plugins in reverse, loggers last
///
/// A cycle ending in `Restarting` starts over; anything else ends the run.
pub struct Host {
    config: HostConfig,
    bus: Arc<EventBus>,
    server: PluginServer,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("server", &self.server)
            .finish()
    }
}

/// Loggers held for the length of one cycle, fed from the bus.
struct LoggerRoute {
    loggers: Vec<PluginRef<dyn LoggerPlugin>>,
    keys: Option<(CallbackKey, CallbackKey)>,
}

impl Host {
    /// Creates a host loading native plugin libraries.
    pub fn new(config: HostConfig, bus: Arc<EventBus>) -> Self {
        let server = PluginServer::new(bus.clone()).with_whitelist(config.whitelist.clone());
        Self { config, bus, server }
    }

    /// Creates a host around an existing plugin server. The host uses the
    /// server's bus.
    pub fn with_server(config: HostConfig, server: PluginServer) -> Self {
        let server = server.with_whitelist(config.whitelist.clone());
        Self {
            config,
            bus: server.bus().clone(),
            server,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn server(&self) -> &PluginServer {
        &self.server
    }

    /// Runs the app until it closes or fails.
    ///
    /// # Returns
    ///
    /// The final status: `Closed` on a clean exit, `Error` otherwise.
    pub fn run(&mut self) -> AppStatus {
        let mut restarts: u32 = 0;

        let status = loop {
            let status = match self.run_cycle() {
                Ok(status) => status,
                Err(e) => {
                    error!("{}", e);
                    AppStatus::Error
                }
            };

            if status != AppStatus::Restarting {
                break status;
            }

            restarts += 1;
            if self.config.max_restarts > 0 && restarts > self.config.max_restarts {
                error!("{}", HostError::TooManyRestarts(self.config.max_restarts));
                break AppStatus::Error;
            }
            info!("Restarting (restart {})", restarts);
        };

        self.bus.clear_all();
        info!("Host finished with status {}", status);
        status
    }

    /// One load, run and unload of every plugin.
    fn run_cycle(&mut self) -> Result<AppStatus, HostError> {
        self.server.initialize(&self.config.plugin_directory)?;

        let route = self.route_logs();
        let status = self.run_app();

        self.server.shutdown();
        self.release_logs(route);
        status
    }

    fn run_app(&mut self) -> Result<AppStatus, HostError> {
        let mut apps = self.server.get_all_of_type::<dyn AppPlugin>();
        let delegate = match apps.len() {
            0 => return Err(HostError::NoApp),
            1 => apps.remove(0),
            _ => {
                let names = apps.iter().map(|app| app.plugin_name().to_string()).collect();
                return Err(HostError::MultipleApps(names));
            }
        };

        let mut app = App::new(self.bus.clone(), Box::new(delegate))
            .with_default_frame_interval(self.config.frame_interval);
        for layer in self.server.get_all_of_type::<dyn Layer>() {
            debug!("Pushing layer {} from plugin {}", layer.name(), layer.plugin_name());
            app.push(Arc::new(layer));
        }

        Ok(app.run())
    }

    /// Feeds `LogMessageEvent`s to every logger plugin until it unloads,
    /// so loggers still see what other plugins log while they unload.
    ///
    /// A logger is flushed right before its `on_unload` and gets no writes
    /// from then on.
    fn route_logs(&self) -> LoggerRoute {
        let loggers = self.server.get_all_of_type::<dyn LoggerPlugin>();
        if loggers.is_empty() {
            return LoggerRoute { loggers, keys: None };
        }

        let targets = loggers.clone();
        let write = self.bus.subscribe(move |record: &mut LogMessageEvent| {
            for logger in targets.iter().filter(|logger| !logger.loaded().is_unloaded()) {
                if record.level.enabled_at(logger.max_level()) {
                    logger.write(record);
                    record.handled = true;
                }
            }
        });

        let targets = loggers.clone();
        let flush = self.bus.subscribe(move |event: &mut PluginUnloadedEvent| {
            for logger in targets.iter().filter(|logger| logger.plugin_name() == event.name) {
                logger.flush();
            }
        });

        LoggerRoute {
            loggers,
            keys: Some((write, flush)),
        }
    }

    fn release_logs(&self, route: LoggerRoute) {
        if let Some((write, flush)) = route.keys {
            self.bus.unsubscribe::<LogMessageEvent>(write);
            self.bus.unsubscribe::<PluginUnloadedEvent>(flush);
        }
        for logger in route.loggers.iter().filter(|logger| !logger.loaded().is_unloaded()) {
            logger.flush();
        }
        // Dropping the last handles destroys the loggers
    }
}
