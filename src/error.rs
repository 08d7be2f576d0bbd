use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CcError>;

#[derive(Debug, Error)]
pub enum CcError {
    /// Required parameters are missing or unreadable (metadata, layout, array shapes).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No usable input exists for the requested day, or for layout detection.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// The output container could not be created or appended to.
    #[error("output error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An input spectral file exists but could not be decoded.
    #[error("failed to read {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("failed to encode/decode record: {0}")]
    Encoding(#[from] bincode::Error),
}

impl CcError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        CcError::Configuration(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        CcError::DataUnavailable(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CcError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        CcError::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error only means the day has nothing to correlate.
    pub fn is_data_unavailable(&self) -> bool {
        matches!(self, CcError::DataUnavailable(_))
    }
}
