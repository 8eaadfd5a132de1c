use thiserror::Error;

/// Errors from the file store and request-time file resolution.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("failed parsing media type: {0}")]
    MediaParse(String),

    #[error("unexpected media type: {0}")]
    MediaUnexpected(String),

    #[error("can't use this file: both blob and ref are unset")]
    FileUnset,

    #[error("don't use both blob and ref together")]
    FileAmbiguous,

    #[error("ref not found in storage: {0}")]
    NotFound(String),

    #[error("storage backend: {0}")]
    Backend(String),

    /// Several resolution errors joined for a whole job.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Joined(Vec<StoreError>),
}

impl StoreError {
    /// Join multiple errors into one, or `Ok(())` when the list is empty.
    pub fn join(errs: Vec<StoreError>) -> StoreResult<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.into_iter().next().unwrap()),
            _ => Err(StoreError::Joined(errs)),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
