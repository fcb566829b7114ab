//! The `tbx` launcher: command line, configuration, logging and signal
//! handling around [`tbx_runtime::Host`].

pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

pub use cli::CliArgs;
pub use config::{AppConfig, ConfigError};
pub use logging::{setup_logging, BusForwardLayer};
pub use signals::close_on_signal;
