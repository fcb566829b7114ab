//! Entry point of the `tbx` launcher.
//!
//! Exit code 0 means the app closed cleanly; anything else is 1.

use anyhow::Context;
use std::process::ExitCode;
use tbx::{close_on_signal, setup_logging, AppConfig, CliArgs};
use tbx_core::EventBus;
use tbx_runtime::{AppStatus, Host};
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run(CliArgs::parse()).await {
        Ok(AppStatus::Closed) => ExitCode::SUCCESS,
        Ok(status) => {
            error!("App finished with status {}", status);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Failed to start tbx: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> anyhow::Result<AppStatus> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;

    // CLI overrides
    if let Some(plugin_dir) = args.plugin_dir {
        config.host.plugin_directory = plugin_dir.to_string_lossy().to_string();
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    config.validate().context("Configuration validation failed")?;

    let bus = EventBus::global();
    setup_logging(&config.logging, Some(bus.clone()))?;

    info!(
        "tbx v{} | Config: {} | Plugins: {}",
        env!("CARGO_PKG_VERSION"),
        args.config_path.display(),
        config.host.plugin_directory
    );

    let signals = close_on_signal(bus.clone());
    let mut host = Host::new(config.to_host_config(), bus);

    // Plugins expect to be loaded, updated and unloaded on one thread
    let status = tokio::task::spawn_blocking(move || host.run())
        .await
        .context("Host thread panicked")?;

    signals.abort();
    info!("tbx shutdown complete");
    Ok(status)
}
