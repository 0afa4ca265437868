use clap::Parser;
use common::{build_runtime, init_log};
use gateway::command::CommandArgs;
use gateway::config::{Config, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> ExitCode {
    let command_line = CommandArgs::parse();
    let config_path = command_line
        .config_file_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid gateway configuration: {e}");
            return ExitCode::from(1);
        }
    };
    config.merge_command_args(&command_line);

    let _log_guard = match init_log(&config.common) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Fail to initialize logging: {e}");
            return ExitCode::from(1);
        }
    };
    let runtime = match build_runtime(&config.common) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Fail to build runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let exit = runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let handle = match gateway::start(config, cancel.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Fail to start gateway: {e}");
                eprintln!("Fail to start gateway: {e}");
                return ExitCode::from(1);
            }
        };
        if let Err(e) = signal::ctrl_c().await {
            error!("Error while waiting for the stop signal: {e}");
        }
        info!("Stop signal received, shutting the gateway down");
        handle.shutdown();
        ExitCode::SUCCESS
    });
    exit
}
