use clap::Parser;
use std::path::PathBuf;

/// The proxy-server, exposing local listeners whose traffic is forwarded
/// through the gateway tunnel
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct CommandArgs {
    /// The configuration file path
    #[arg(short = 'c', long)]
    pub config_file_path: Option<PathBuf>,
    /// The worker thread number
    #[arg(short = 't', long)]
    pub worker_threads: Option<usize>,
    /// The log directory path
    #[arg(short = 'l', long)]
    pub log_directory: Option<PathBuf>,
    /// The max log level
    #[arg(short = 'm', long)]
    pub max_log_level: Option<String>,
}
