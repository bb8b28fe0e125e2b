//! Domain-specific errors for deployment operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("failed to detect binary format: {0}")]
    BadFormat(String),

    #[error("missing required tools: {0}")]
    MissingTools(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("required Qt library not found in search paths: {0}")]
    MissingQtLibrary(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Process exit code for the error, per the CLI contract: 2 for bad
    /// invocations and preconditions, 1 for failures during staging.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::BadFormat(_) | Self::MissingTools(_) | Self::InvalidInput(_) => 2,
            Self::MissingQtLibrary(_) | Self::Io(_) => 1,
        }
    }
}
