use clap::Parser;
use common::{RoleState, build_runtime, init_log};
use proxy_client::command::CommandArgs;
use proxy_client::config::{Config, DEFAULT_CONFIG_FILE};
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
            eprintln!("Invalid proxy-client configuration: {e}");
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

    let final_state = runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let mut handle = proxy_client::start(config, cancel.clone());
        let finished = tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Stop signal received, shutting the proxy-client down");
                cancel.cancel();
                None
            }
            state = handle.join() => Some(state),
        };
        match finished {
            Some(state) => state,
            None => handle.join().await,
        }
    });
    match final_state {
        RoleState::FailedAuth => {
            error!("Terminal authentication failure");
            eprintln!("Terminal authentication failure");
            ExitCode::from(2)
        }
        _ => ExitCode::SUCCESS,
    }
}
