use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Empty frame cannot carry a message")]
    EmptyFrame,
    #[error("Message payload truncated")]
    Truncated,
    #[error("Declared field length overruns the message payload")]
    LengthOverrun,
    #[error("Invalid role tag: {0}")]
    InvalidRole(u8),
    #[error("Host field is not valid UTF-8")]
    InvalidHost(#[from] std::string::FromUtf8Error),
}
