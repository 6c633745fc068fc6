use std::io;
use std::path::PathBuf;

use facegate_vision::{DimensionMismatch, ExtractionError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decrypt template store {path}: wrong key or corrupted file")]
    Decryption { path: PathBuf },

    #[error("feature vector dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("template store {path} does not exist yet")]
    NotFound { path: PathBuf },

    #[error("template store encoding error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("template store encryption error: {0}")]
    Encryption(String),

    #[error("no enrollment record with id {0}")]
    RecordNotFound(Uuid),

    #[error("enrollment record {0} has an empty name")]
    EmptyName(Uuid),

    #[error("invalid configuration {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl AuthError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AuthError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<DimensionMismatch> for AuthError {
    fn from(err: DimensionMismatch) -> Self {
        AuthError::DimensionMismatch {
            expected: err.expected,
            found: err.found,
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("enrollment name must not be empty")]
    EmptyName,

    #[error("no face detected in enrollment image")]
    NoFace,

    #[error("could not extract face encoding: {0}")]
    Extractor(String),

    #[error(transparent)]
    Store(#[from] AuthError),
}

impl From<ExtractionError> for EnrollError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::NotFound => EnrollError::NoFace,
            ExtractionError::Failed(message) => EnrollError::Extractor(message),
        }
    }
}
