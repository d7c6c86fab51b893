//! optimizerd - Entry Point
//!
//! Runs remote optimization jobs on rented cloud VMs and keeps their records
//! honest across restarts.

use std::env;
use std::process::ExitCode;

use optimizerd::app::options::AppOptions;
use optimizerd::app::run::run;
use optimizerd::app::state::AppState;
use optimizerd::errors::OrchestratorError;
use optimizerd::keys::{openssh, provider};
use optimizerd::logs::{init_logging, LogLevel, LogOptions};
use optimizerd::storage::kv::JsonKvStore;
use optimizerd::storage::layout::StorageLayout;
use optimizerd::storage::settings::Settings;
use optimizerd::utils::{parse_cli_args, version_info};

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli_args = parse_cli_args(env::args().skip(1));

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let mut settings = match layout.settings_file().read_json_or_default::<Settings>().await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli_args.get("log-level") {
        match level.parse::<LogLevel>() {
            Ok(level) => settings.log_level = level,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    if let Err(e) = settings.validate() {
        error!("Invalid settings: {}", e);
        return ExitCode::FAILURE;
    }

    let result = if cli_args.contains_key("ensure-keys") {
        ensure_keys(&layout).await
    } else {
        serve(layout, settings).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("optimizerd failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn ensure_keys(layout: &StorageLayout) -> Result<(), OrchestratorError> {
    layout.setup().await?;
    let kv = JsonKvStore::open(layout.kv_file()).await?;
    let status = provider::ensure_key_pair(&kv).await?;
    match provider::load_public_key(&kv).await? {
        Some(line) => {
            let fingerprint = openssh::fingerprint(&line)?;
            info!("SSH key pair: {:?}", status);
            println!("{}\n{}", line, fingerprint);
        }
        None => info!("SSH key pair: {:?}, no public key stored", status),
    }
    Ok(())
}

async fn serve(layout: StorageLayout, settings: Settings) -> Result<(), OrchestratorError> {
    let options = AppOptions::from_settings(layout, &settings);
    let app_state = AppState::init(settings, &options.layout).await?;

    info!(
        "Running optimizerd {} on {}:{}",
        version_info().version,
        options.server.host,
        options.server.port
    );
    run(options, app_state, await_shutdown_signal()).await
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Could not install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
