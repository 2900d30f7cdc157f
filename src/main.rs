//! yocto-sync - host for the yoctocore configuration sync engine

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use yocto_sync::cli;
use yocto_sync::config::{AppConfig, ConfigWatcher};
use yocto_sync::device::{list_ports_formatted, MidirPorts};
use yocto_sync::engine::{EngineHandle, SyncEngine};
use yocto_sync::paths::AppPaths;

/// Keep a yoctocore's configuration in sync over MIDI SysEx
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Also write logs to a daily file in the logs directory
    #[arg(long)]
    log_file: bool,

    /// List available MIDI ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Send the bootloader reset to the device and exit
    #[arg(long)]
    reset: bool,

    /// Run without the interactive prompt
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let paths = AppPaths::resolve(args.config.as_deref());
    let config_path = paths.config_str();

    // Logging config comes from the file. A bad file is reported once logging
    // is up, then the defaults run until a good save is picked up.
    let file_config = AppConfig::load(&config_path).await;
    let logging = file_config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    let level = args.log_level.clone().unwrap_or_else(|| logging.level.clone());
    let log_dir = (args.log_file || logging.file).then(|| paths.logs_dir.clone());
    if log_dir.is_some() {
        paths.ensure_directories()?;
    }
    let _log_guard = init_logging(&level, log_dir.as_deref(), logging.json)?;

    info!("Starting yocto-sync v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", config_path);
    if let Err(e) = &file_config {
        warn!("{:#}; running with defaults", e);
    }

    let config = file_config.unwrap_or_default();
    let ports = MidirPorts::new(config.device.client_name.clone());

    if args.list_ports {
        list_ports_formatted(&ports, &config.device.name_patterns)?;
        return Ok(());
    }

    if args.reset {
        return reset_device(ports, &config).await;
    }

    let config_watcher = ConfigWatcher::start(&config_path).await?;

    let (engine, handle) = SyncEngine::new(ports, config.engine_settings())?;

    run_app(engine, handle, config_watcher, args.headless).await?;

    info!("yocto-sync shutdown complete");
    Ok(())
}

async fn run_app(
    engine: SyncEngine<MidirPorts>,
    handle: EngineHandle,
    mut config_watcher: ConfigWatcher,
    headless: bool,
) -> Result<()> {
    let engine_task = engine.run();
    tokio::pin!(engine_task);

    let repl_task = async {
        if headless {
            std::future::pending::<Result<()>>().await
        } else {
            let repl_handle = handle.clone();
            let runtime = tokio::runtime::Handle::current();
            tokio::task::spawn_blocking(move || cli::run_repl(repl_handle, runtime)).await?
        }
    };
    tokio::pin!(repl_task);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut engine_task => return result,

            result = &mut repl_task => {
                if let Err(e) = result {
                    warn!("Prompt failed: {:#}", e);
                }
                break;
            }

            Some(new_config) = config_watcher.next_config() => {
                info!("Configuration file changed, applying");
                handle.apply_settings(new_config.engine_settings());
            }

            _ = &mut shutdown => break,
        }
    }

    handle.shutdown();
    engine_task.await
}

/// Connect, send the reset and leave
async fn reset_device(ports: MidirPorts, config: &AppConfig) -> Result<()> {
    let (engine, handle) = SyncEngine::new(ports, config.engine_settings())?;

    let control = async {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        if handle.is_connected() {
            handle.reset_device();
            info!("Reset sent");
        } else {
            warn!("No device found, reset not sent");
        }
        // Give the engine a turn to flush before stopping it
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.shutdown();
    };

    let (result, ()) = tokio::join!(engine.run(), control);
    result
}

fn init_logging(
    level: &str,
    log_dir: Option<&std::path::Path>,
    json: bool,
) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "yocto-sync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            let layer = if json { layer.json().boxed() } else { layer.boxed() };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
