//! Logging setup for the launcher.
//!
//! Host output goes through a `tracing-subscriber` registry: an `EnvFilter`
//! (`RUST_LOG` wins over the configured level) and a human readable or JSON
//! `fmt` layer. Optionally a [`BusForwardLayer`] republishes every record as
//! a [`LogMessageEvent`] so logger plugins see the host's log stream.

use std::cell::Cell;
use std::fmt::Write as _;
use std::sync::Arc;
use tbx_core::{EventBus, LogLevel, LogMessageEvent};
use tracing::field::{Field, Visit};
use tracing::{info, Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::config::LoggingSettings;

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Initializes the global logging system.
///
/// # Arguments
///
/// * `config` - Level and output format
/// * `bus` - Where to forward records, if `forward_to_plugins` is set
///
/// # Returns
///
/// An error if a global subscriber is already installed.
pub fn setup_logging(config: &LoggingSettings, bus: Option<Arc<EventBus>>) -> anyhow::Result<()> {
    let level = config.level.to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let forward = bus
        .filter(|_| config.forward_to_plugins)
        .map(BusForwardLayer::new);

    let registry = tracing_subscriber::registry().with(filter).with(forward);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    info!("Logging initialized with level: {}", level);
    Ok(())
}

/// Republishes log records on the event bus.
///
/// A record logged by a subscriber while it handles a forwarded record is
/// not forwarded again.
pub struct BusForwardLayer {
    bus: Arc<EventBus>,
}

impl BusForwardLayer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl<S: Subscriber> Layer<S> for BusForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if FORWARDING.with(Cell::get) {
            return;
        }

        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        FORWARDING.with(|flag| flag.set(true));
        let mut record = LogMessageEvent::new(
            LogLevel::from(metadata.level()),
            metadata.target().to_string(),
            visitor.finish(),
        );
        self.bus.send(&mut record);
        FORWARDING.with(|flag| flag.set(false));
    }
}

/// Collects the `message` field followed by any other fields as
/// `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}
