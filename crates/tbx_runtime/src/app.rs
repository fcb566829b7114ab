//! The app: launch, the per-frame update and close.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbx_core::{
    type_key, AppClosedEvent, AppLaunchedEvent, AppPlugin, AppSettings, CloseAppRequest,
    EventBus, FrameCompleted, Layer, OpenNewWindowRequest, PluginError,
    RestartAppRequest, Subscription, Uid, WindowClosedEvent,
};
use tracing::{debug, error, info, warn};

use crate::clock::DeltaClock;
use crate::error::AppError;
use crate::layer_stack::{LayerId, LayerStack};

/// Where the app is in its lifecycle.
///
/// ```text
/// Initializing -> Running      launch
/// Running      -> Closing      close requested
/// Closing      -> Closed       cleanup complete
/// Running      -> Restarting   restart requested
/// any          -> Error        uncaught failure
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppStatus {
    Initializing,
    Running,
    Restarting,
    Closing,
    Closed,
    Error,
}

impl AppStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AppStatus::Initializing,
            1 => AppStatus::Running,
            2 => AppStatus::Restarting,
            3 => AppStatus::Closing,
            4 => AppStatus::Closed,
            _ => AppStatus::Error,
        }
    }

    /// Whether the app has stopped for good.
    pub fn is_final(self) -> bool {
        matches!(self, AppStatus::Closed | AppStatus::Error)
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AppStatus::Initializing => "initializing",
            AppStatus::Running => "running",
            AppStatus::Restarting => "restarting",
            AppStatus::Closing => "closing",
            AppStatus::Closed => "closed",
            AppStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// State shared with the app's bus subscriptions, which may run on any
/// thread.
#[derive(Debug)]
struct SharedState {
    status: AtomicU8,
    main_window: AtomicU64,
}

impl SharedState {
    fn status(&self) -> AppStatus {
        AppStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set(&self, status: AppStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Moves to `to` if the current status is one of `from`.
    fn transition(&self, from: &[AppStatus], to: AppStatus) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                from.contains(&AppStatus::from_u8(current)).then_some(to as u8)
            })
            .is_ok()
    }

    fn request_close(&self) -> bool {
        self.transition(&[AppStatus::Initializing, AppStatus::Running], AppStatus::Closing)
    }

    fn request_restart(&self) -> bool {
        self.transition(&[AppStatus::Initializing, AppStatus::Running], AppStatus::Restarting)
    }

    fn main_window(&self) -> Uid {
        Uid(self.main_window.load(Ordering::Acquire))
    }
}

/// The running application: the app plugin, its layers and the main loop.
///
/// Only one app exists per process. The host creates one per run of the
/// plugin server and drops it before the plugins are unloaded.
pub struct App {
    settings: AppSettings,
    delegate: Box<dyn AppPlugin>,
    bus: Arc<EventBus>,
    layers: LayerStack,
    clock: DeltaClock,
    state: Arc<SharedState>,
    subscriptions: Mutex<Vec<Subscription>>,
    frame_interval: Option<Duration>,
    launched: bool,
    closed: bool,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.settings.name)
            .field("status", &self.status())
            .field("layers", &self.layers)
            .finish()
    }
}

impl App {
    pub fn new(bus: Arc<EventBus>, delegate: Box<dyn AppPlugin>) -> Self {
        let settings = delegate.settings();
        let frame_interval = settings.frame_interval;
        Self {
            settings,
            delegate,
            bus,
            layers: LayerStack::new(),
            clock: DeltaClock::new(),
            state: Arc::new(SharedState {
                status: AtomicU8::new(AppStatus::Initializing as u8),
                main_window: AtomicU64::new(Uid::INVALID.0),
            }),
            subscriptions: Mutex::new(Vec::new()),
            frame_interval,
            launched: false,
            closed: false,
        }
    }

    /// Frame pacing used when the app plugin does not ask for one.
    pub fn with_default_frame_interval(mut self, interval: Option<Duration>) -> Self {
        if self.settings.frame_interval.is_none() {
            self.frame_interval = interval.filter(|i| !i.is_zero());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn status(&self) -> AppStatus {
        self.state.status()
    }

    /// The window opened at launch, if a windowing plugin answered.
    pub fn main_window(&self) -> Option<Uid> {
        Some(self.state.main_window()).filter(|id| id.is_valid())
    }

    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    pub fn push_layer(&mut self, layer: Arc<dyn Layer>) -> LayerId {
        self.layers.push_layer(layer)
    }

    pub fn push_overlay(&mut self, layer: Arc<dyn Layer>) -> LayerId {
        self.layers.push_overlay(layer)
    }

    /// Pushes as a layer or an overlay, as the layer asks.
    pub fn push(&mut self, layer: Arc<dyn Layer>) -> LayerId {
        self.layers.push(layer)
    }

    pub fn pop_layer(&mut self, id: LayerId) -> Option<Arc<dyn Layer>> {
        self.layers.pop_layer(id)
    }

    /// Launches the app: hooks up the close and restart requests, asks for
    /// the main window and runs the app plugin's `on_launch`.
    pub fn launch(&mut self) -> Result<(), AppError> {
        if self.launched {
            return Err(AppError::AlreadyLaunched);
        }
        self.launched = true;
        info!("Launching app {}", self.settings.name);

        self.subscribe_requests();
        self.open_main_window();

        let result = catch_unwind(AssertUnwindSafe(|| self.delegate.on_launch()))
            .unwrap_or_else(|payload| Err(PluginError::from_panic(payload)));
        if let Err(source) = result {
            return Err(self.fail(AppError::Launch(source)));
        }

        self.clock.reset();
        if self
            .state
            .transition(&[AppStatus::Initializing], AppStatus::Running)
        {
            info!("App {} is running", self.settings.name);
        }
        self.bus
            .send(&mut AppLaunchedEvent::new(self.settings.name.clone()));
        Ok(())
    }

    /// Runs one frame: deferred events first, then every layer, then the
    /// app plugin, then `FrameCompleted`.
    pub fn update(&mut self) -> Result<(), AppError> {
        if self.status() != AppStatus::Running {
            return Ok(());
        }

        let frame = self.clock.tick();
        let processed = self.bus.process();
        if processed > 0 {
            debug!(frame = frame.frame, "Processed {} posted events", processed);
        }

        for layer in self.layers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| layer.on_update(&frame)))
                .unwrap_or_else(|payload| Err(PluginError::from_panic(payload)));
            if let Err(source) = result {
                let error = AppError::Layer {
                    layer: layer.name().to_string(),
                    frame: frame.frame,
                    source,
                };
                return Err(self.fail(error));
            }
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.delegate.on_update(&frame)))
            .unwrap_or_else(|payload| Err(PluginError::from_panic(payload)));
        if let Err(source) = result {
            return Err(self.fail(AppError::Update {
                frame: frame.frame,
                source,
            }));
        }

        self.bus
            .send(&mut FrameCompleted::new(frame.frame, frame.delta));
        Ok(())
    }

    /// Asks the app to close after the current frame.
    pub fn request_close(&self) {
        self.state.request_close();
    }

    /// Asks the app to stop so the host can relaunch it.
    pub fn restart(&self) {
        if self.state.request_restart() {
            info!("App {} is restarting", self.settings.name);
        }
    }

    /// Detaches every layer, drops the app's subscriptions and runs the app
    /// plugin's `on_shutdown`. The status ends as `Closed` unless the app is
    /// restarting or failed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.state.request_close();
        self.layers.clear();
        for subscription in std::mem::take(&mut *self.subscriptions.lock()) {
            self.bus.remove_subscription(subscription);
        }

        if self.launched {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.delegate.on_shutdown())) {
                error!(
                    "App {} panicked during shutdown: {}",
                    self.settings.name,
                    tbx_core::panic_message(payload.as_ref())
                );
            }
        }

        self.state.transition(&[AppStatus::Closing], AppStatus::Closed);
        let status = self.status();
        info!("App {} stopped ({})", self.settings.name, status);
        self.bus.send(&mut AppClosedEvent::new(
            self.settings.name.clone(),
            status == AppStatus::Restarting,
        ));
    }

    /// Launches, updates until the app stops running, closes, and returns
    /// the final status.
    pub fn run(&mut self) -> AppStatus {
        if let Err(e) = self.launch() {
            error!("{}", e);
            self.close();
            return self.status();
        }

        while self.status() == AppStatus::Running {
            if let Err(e) = self.update() {
                error!("{}", e);
                break;
            }
            self.pace();
        }

        self.close();
        self.status()
    }

    fn pace(&self) {
        if let Some(interval) = self.frame_interval {
            let spent = self.clock.since_tick();
            if spent < interval {
                std::thread::sleep(interval - spent);
            }
        }
    }

    fn fail(&self, error: AppError) -> AppError {
        error!("App {} failed: {}", self.settings.name, error);
        self.state.set(AppStatus::Error);
        error
    }

    fn subscribe_requests(&self) {
        let mut subscriptions = self.subscriptions.lock();

        let state = self.state.clone();
        let key = self.bus.subscribe(move |request: &mut CloseAppRequest| {
            if state.request_close() {
                info!("Close requested");
            }
            request.handled = true;
        });
        subscriptions.push(Subscription {
            event: type_key::<CloseAppRequest>(),
            callback: key,
        });

        let state = self.state.clone();
        let key = self.bus.subscribe(move |request: &mut RestartAppRequest| {
            if state.request_restart() {
                info!("Restart requested");
            }
            request.handled = true;
        });
        subscriptions.push(Subscription {
            event: type_key::<RestartAppRequest>(),
            callback: key,
        });

        let state = self.state.clone();
        let key = self.bus.subscribe(move |event: &mut WindowClosedEvent| {
            let main = state.main_window();
            if main.is_valid() && event.window == main && state.request_close() {
                info!("Main window closed");
            }
        });
        subscriptions.push(Subscription {
            event: type_key::<WindowClosedEvent>(),
            callback: key,
        });
    }

    fn open_main_window(&self) {
        let mut request = OpenNewWindowRequest::new(
            self.settings.window_title.clone(),
            self.settings.window_width,
            self.settings.window_height,
        );
        if !self.bus.send(&mut request) {
            debug!("No window plugin answered; running headless");
            return;
        }
        match request.result {
            Some(window) if window.is_valid() => {
                self.state.main_window.store(window.0, Ordering::Release);
                debug!("Opened main window {}", window);
            }
            _ => warn!("Window request was handled without a window id"),
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if self.launched {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbx_core::{Event, FrameContext};

    #[derive(Default)]
    struct Script {
        log: Mutex<Vec<String>>,
        close_after: Option<u64>,
        fail_launch: bool,
        fail_update_at: Option<u64>,
    }

    struct ScriptedApp {
        script: Arc<Script>,
        bus: Arc<EventBus>,
    }

    impl AppPlugin for ScriptedApp {
        fn settings(&self) -> AppSettings {
            AppSettings::new("scripted").with_window("Scripted", 640, 480)
        }

        fn on_launch(&self) -> Result<(), PluginError> {
            self.script.log.lock().push("launch".to_string());
            if self.script.fail_launch {
                return Err(PluginError::InitializationFailed("no config".to_string()));
            }
            Ok(())
        }

        fn on_update(&self, frame: &FrameContext) -> Result<(), PluginError> {
            self.script.log.lock().push(format!("update {}", frame.frame));
            if self.script.fail_update_at == Some(frame.frame) {
                return Err(PluginError::ExecutionError("bad frame".to_string()));
            }
            if self.script.close_after == Some(frame.frame) {
                self.bus.send(&mut CloseAppRequest::new());
            }
            Ok(())
        }

        fn on_shutdown(&self) {
            self.script.log.lock().push("shutdown".to_string());
        }
    }

    struct Tracking {
        name: &'static str,
        log: Arc<Script>,
        panic_at: Option<u64>,
    }

    impl Layer for Tracking {
        fn name(&self) -> &str {
            self.name
        }

        fn on_detach(&self) {
            self.log.log.lock().push(format!("detach {}", self.name));
        }

        fn on_update(&self, frame: &FrameContext) -> Result<(), PluginError> {
            if self.panic_at == Some(frame.frame) {
                panic!("layer blew up");
            }
            self.log.log.lock().push(format!("{} {}", self.name, frame.frame));
            Ok(())
        }
    }

    fn app_with(script: Script) -> (App, Arc<Script>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let script = Arc::new(script);
        let app = App::new(
            bus.clone(),
            Box::new(ScriptedApp {
                script: script.clone(),
                bus: bus.clone(),
            }),
        );
        (app, script, bus)
    }

    fn entries(script: &Script) -> Vec<String> {
        script.log.lock().clone()
    }

    #[test]
    fn test_run_until_close_requested() {
        let (mut app, script, bus) = app_with(Script {
            close_after: Some(1),
            ..Default::default()
        });
        app.push_overlay(Arc::new(Tracking {
            name: "hud",
            log: script.clone(),
            panic_at: None,
        }));
        app.push_layer(Arc::new(Tracking {
            name: "world",
            log: script.clone(),
            panic_at: None,
        }));

        let frames = Arc::new(Mutex::new(Vec::new()));
        let seen = frames.clone();
        bus.subscribe(move |event: &mut FrameCompleted| seen.lock().push(event.frame));

        assert_eq!(app.run(), AppStatus::Closed);
        assert_eq!(
            entries(&script),
            vec![
                "launch", "world 0", "hud 0", "update 0", "world 1", "hud 1", "update 1",
                "detach hud", "detach world", "shutdown",
            ]
        );
        assert_eq!(*frames.lock(), vec![0, 1]);
        assert!(app.layers().is_empty());
        // Only the test's own FrameCompleted subscriber is left
        assert_eq!(bus.total_subscribers(), 1);
    }

    #[test]
    fn test_headless_launch() {
        let (mut app, _script, _bus) = app_with(Script::default());
        app.launch().unwrap();
        assert_eq!(app.status(), AppStatus::Running);
        assert_eq!(app.main_window(), None);
        assert!(matches!(app.launch(), Err(AppError::AlreadyLaunched)));
        app.close();
        assert_eq!(app.status(), AppStatus::Closed);
    }

    #[test]
    fn test_main_window_close_closes_app() {
        let (mut app, _script, bus) = app_with(Script::default());
        let window = Uid::new();
        bus.subscribe(move |request: &mut OpenNewWindowRequest| {
            assert_eq!((request.width, request.height), (640, 480));
            request.result = Some(window);
            request.handled = true;
        });

        app.launch().unwrap();
        assert_eq!(app.main_window(), Some(window));

        bus.send(&mut WindowClosedEvent::new(Uid::new()));
        assert_eq!(app.status(), AppStatus::Running);

        bus.send(&mut WindowClosedEvent::new(window));
        assert_eq!(app.status(), AppStatus::Closing);
        app.close();
        assert_eq!(app.status(), AppStatus::Closed);
    }

    #[test]
    fn test_restart_request_survives_close() {
        let (mut app, _script, bus) = app_with(Script::default());
        let closed = Arc::new(Mutex::new(None));
        let sink = closed.clone();
        bus.subscribe(move |event: &mut AppClosedEvent| *sink.lock() = Some(event.restarting));

        app.launch().unwrap();
        let mut request = RestartAppRequest::new();
        assert!(bus.send(&mut request));
        assert!(request.is_handled());
        assert_eq!(app.status(), AppStatus::Restarting);

        app.close();
        assert_eq!(app.status(), AppStatus::Restarting);
        assert_eq!(*closed.lock(), Some(true));
    }

    #[test]
    fn test_close_posted_from_another_thread() {
        let (mut app, _script, bus) = app_with(Script::default());
        app.launch().unwrap();

        let remote = bus.clone();
        std::thread::spawn(move || {
            remote.post(CloseAppRequest::new());
        })
        .join()
        .unwrap();

        assert_eq!(app.status(), AppStatus::Running);
        app.update().unwrap();
        assert_eq!(app.status(), AppStatus::Closing);
    }

    #[test]
    fn test_failed_launch_is_an_error() {
        let (mut app, script, _bus) = app_with(Script {
            fail_launch: true,
            ..Default::default()
        });
        assert_eq!(app.run(), AppStatus::Error);
        assert_eq!(entries(&script), vec!["launch", "shutdown"]);
    }

    #[test]
    fn test_panicking_layer_is_an_error() {
        let (mut app, script, _bus) = app_with(Script::default());
        app.push_layer(Arc::new(Tracking {
            name: "world",
            log: script.clone(),
            panic_at: Some(2),
        }));

        assert_eq!(app.run(), AppStatus::Error);
        assert_eq!(
            entries(&script),
            vec![
                "launch", "world 0", "update 0", "world 1", "update 1", "detach world",
                "shutdown",
            ]
        );
    }

    #[test]
    fn test_failed_update_is_an_error() {
        let (mut app, _script, _bus) = app_with(Script {
            fail_update_at: Some(0),
            ..Default::default()
        });
        app.launch().unwrap();
        assert!(matches!(app.update(), Err(AppError::Update { frame: 0, .. })));
        assert_eq!(app.status(), AppStatus::Error);

        // Nothing runs once the app failed
        app.update().unwrap();
        app.close();
        assert_eq!(app.status(), AppStatus::Error);
    }

    #[test]
    fn test_frame_interval_paces_frames() {
        let (app, _script, _bus) = app_with(Script::default());
        let mut app = app.with_default_frame_interval(Some(Duration::from_millis(5)));
        app.launch().unwrap();

        let started = std::time::Instant::now();
        for _ in 0..3 {
            app.update().unwrap();
            app.pace();
        }
        assert!(started.elapsed() >= Duration::from_millis(15));
        app.close();
    }
}
