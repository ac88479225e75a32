//! Error taxonomy shared by the library and the three executables.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport could not be brought up (bind refused, peer missing).
    #[error("transport: {0}")]
    Transport(String),

    /// Policy artefact missing or malformed.
    #[error("artefact {}: {reason}", path.display())]
    Artefact { path: PathBuf, reason: String },

    /// Invalid configuration that survived CLI parsing.
    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit code for this error category.
    ///
    /// 1 = argument/config error, 2 = transport initialisation failure,
    /// 3 = artefact load failure without a fallback.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Transport(_) => 2,
            Error::Artefact { .. } => 3,
            Error::Io(_) => 1,
        }
    }
}
