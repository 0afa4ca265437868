use common::Error as CommonError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Common(#[from] CommonError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
