//! # Tbx Core
//!
//! Everything a Tbx plugin links against: process-unique ids and typed hash
//! keys, the event bus, the events the host itself understands, and the
//! plugin interface with its capability traits.
//!
//! ## Event bus
//!
//! The [`EventBus`] is a typed publish/subscribe hub. `send` dispatches
//! synchronously to every subscriber of the event's type and reports whether
//! any of them marked the event handled. `post` defers dispatch until the
//! main loop calls `process`. An [`EventSuppressor`] turns `send` into a
//! no-op for as long as it lives.
//!
//! ```ignore
//! define_event! {
//!     pub struct Tick { pub t: u32 }
//! }
//!
//! let bus = EventBus::new();
//! let key = bus.subscribe(|tick: &mut Tick| tick.handled = tick.t > 0);
//! assert!(bus.send(&mut Tick::new(1)));
//! bus.unsubscribe::<Tick>(key);
//! ```
//!
//! ## Plugins
//!
//! A plugin is a type implementing [`Plugin`], exported with
//! [`register_plugin!`]. It advertises what else it is (a logger, a layer, the
//! app) through the `as_*` methods on [`Plugin`], and talks to the rest of
//! the process only through the bus in its [`PluginContext`].

pub mod bus;
pub mod context;
pub mod error;
pub mod event;
pub mod events;
pub mod hashing;
pub mod ids;
pub mod log;
mod macros;
pub mod plugin;

pub use bus::{EventBus, EventSuppressor, PostedEvent, Subscription};
pub use context::{LogSink, PluginContext};
pub use error::{panic_message, EventError, PluginError};
pub use event::{Event, Request};
pub use events::*;
pub use hashing::{callback_key, hash_combine, method_key, type_key, CallbackKey, TypeKey};
pub use ids::{generate_guid, next_uid, Guid, Uid};
pub use log::LogLevel;
pub use plugin::{
    ApiVersionFn, AppPlugin, AppSettings, Capability, CreatePluginFn, DestroyPluginFn,
    FrameContext, Layer, LoggerPlugin, Plugin, PluginExports, API_VERSION_SYMBOL,
    CREATE_PLUGIN_SYMBOL, DESTROY_PLUGIN_SYMBOL, PLUGIN_API_VERSION,
};
