use diesel::r2d2;
use thiserror::Error;

/// Failures never leak NULLs or driver types to callers - everything is
/// either `NotFound` or an opaque `Storage` failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => StoreError::NotFound("record not found".into()),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
