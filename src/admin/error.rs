use std::path::{Path, PathBuf};

use crate::types::TesseraError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No store at the specified path.
    #[error("store not found: {0}")]
    MissingStore(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Core store error.
    #[error(transparent)]
    Core(#[from] TesseraError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_store(path: impl AsRef<Path>) -> Self {
        AdminError::MissingStore(path.as_ref().to_path_buf())
    }

    /// Snake_case kind printed by the CLI, matching the core error kinds.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AdminError::MissingStore(_) => "not_found",
            AdminError::Message(_) => "bad_argument",
            AdminError::Core(err) => err.kind().as_str(),
            AdminError::Io(_) => "io",
        }
    }
}
