use crate::config::CommonConfig;
use crate::error::Error;
use tokio::runtime::{Builder, Runtime};

/// Build the multi-threaded runtime a role instance runs on.
pub fn build_runtime(config: &CommonConfig) -> Result<Runtime, Error> {
    Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
        .map_err(Into::into)
}
