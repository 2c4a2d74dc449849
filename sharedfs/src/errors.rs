use crate::db::errors::DbError;
use crate::exec::CommandError;
use std::path::PathBuf;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// No record for the requested service
    #[error("Service {service_id} not found")]
    NotFound { service_id: String },

    /// A stored record that cannot be acted on
    #[error("{reason} for service_id: {service_id}")]
    InvalidRecord { service_id: String, reason: String },

    /// An OS command failed or timed out
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Store operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Reading or writing a file under the home root failed
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration that cannot be used
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the failure left OS state that a retry of the same call can repair.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Command(_) | Error::Io { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
