use crate::session::SessionError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Usage(#[from] clap::Error),
    #[error("no command given after '--cmd'")]
    MissingCommand,
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CliError {
    /// Process exit status: 2 for usage errors, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Usage(err) => u8::try_from(err.exit_code()).unwrap_or(2),
            CliError::MissingCommand | CliError::InvalidArgument(_) => 2,
            _ => 1,
        }
    }
}
