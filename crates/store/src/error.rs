use thiserror::Error;

/// The single error taxonomy member the persistence interface exposes:
/// everything else is recovered into an `Option` return.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("invalid data in storage: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
