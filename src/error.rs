use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied input of the wrong shape (scenario, prompt file, template).
    #[error("Validation error: {0}")]
    Validation(String),

    /// An artifact could not be written or encoded.
    #[error("Failed to write {path}: {message}")]
    Conversion { path: PathBuf, message: String },

    /// A spreadsheet is structurally unreadable.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// The LLM collaborator failed.
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn conversion(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Conversion {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
