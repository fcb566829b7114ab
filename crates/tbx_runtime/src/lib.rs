//! # Tbx Runtime
//!
//! The in-process side of a Tbx host: the [`App`] with its [`LayerStack`]
//! and main loop, and the [`Host`] driver that loads plugins, runs the app
//! and unloads everything again, restarting when asked to.
//!
//! ```ignore
//! let mut host = Host::new(HostConfig::new("plugins"), EventBus::global());
//! let status = host.run();
//! std::process::exit(if status == AppStatus::Closed { 0 } else { 1 });
//! ```

pub mod app;
pub mod clock;
pub mod error;
pub mod host;
pub mod layer_stack;

pub use app::{App, AppStatus};
pub use clock::DeltaClock;
pub use error::{AppError, HostError};
pub use host::{Host, HostConfig};
pub use layer_stack::{LayerId, LayerStack};
