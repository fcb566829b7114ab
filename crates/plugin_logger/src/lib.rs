//! Reference logger plugin.
//!
//! Every log record the host forwards is written to stderr and appended to
//! `logs/tbx.log` inside the plugin's directory. If the file cannot be
//! opened the plugin keeps logging to stderr only.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tbx_core::{
    register_plugin, LogLevel, LogMessageEvent, LoggerPlugin, Plugin, PluginContext, PluginError,
};

pub const LOG_DIRECTORY: &str = "logs";
pub const LOG_FILE: &str = "tbx.log";

pub struct FileLogger {
    started: Instant,
    file: Mutex<Option<BufWriter<File>>>,
    path: Mutex<Option<PathBuf>>,
    echo: bool,
}

impl FileLogger {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            file: Mutex::new(None),
            path: Mutex::new(None),
            echo: true,
        }
    }

    /// A logger that only writes to its file.
    pub fn quiet() -> Self {
        Self {
            echo: false,
            ..Self::new()
        }
    }

    /// Path of the open log file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }

    /// Opens (appending) the log file below `directory`.
    pub fn open(&self, directory: &Path) -> io::Result<PathBuf> {
        let log_dir = directory.join(LOG_DIRECTORY);
        fs::create_dir_all(&log_dir)?;
        let path = log_dir.join(LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        *self.file.lock() = Some(BufWriter::new(file));
        *self.path.lock() = Some(path.clone());
        Ok(path)
    }

    fn format(&self, record: &LogMessageEvent) -> String {
        let elapsed = self.started.elapsed();
        format!(
            "[{:>6}.{:03}] {:<5} {}: {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            record.level.as_str().to_ascii_uppercase(),
            record.target,
            record.message
        )
    }
}

impl Default for FileLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for FileLogger {
    fn on_load(&self, context: &Arc<PluginContext>) -> Result<(), PluginError> {
        match self.open(context.directory()) {
            Ok(path) => context.log(
                LogLevel::Debug,
                format!("Writing log to {}", path.display()),
            ),
            Err(e) => context.log(
                LogLevel::Warn,
                format!("No log file, writing to stderr only: {}", e),
            ),
        }
        Ok(())
    }

    fn on_unload(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
        self.flush();
        *self.file.lock() = None;
        Ok(())
    }

    fn as_logger(&self) -> Option<&(dyn LoggerPlugin + 'static)> {
        Some(self)
    }
}

impl LoggerPlugin for FileLogger {
    fn write(&self, record: &LogMessageEvent) {
        let line = self.format(record);
        if self.echo {
            eprintln!("{}", line);
        }
        if let Some(file) = self.file.lock().as_mut() {
            // A full disk must not take the host down
            let _ = writeln!(file, "{}", line);
        }
    }

    fn flush(&self) {
        if let Some(file) = self.file.lock().as_mut() {
            let _ = file.flush();
        }
    }
}

register_plugin!(FileLogger);
