//! Failures surfaced by the sync layer.

use thiserror::Error;

/// Every gateway, cache and vote operation fails with one of these.
///
/// `Clone` because one in-flight fetch fans its result out to every reader
/// waiting on the same cache key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("You must be signed in to do that")]
    Unauthenticated,

    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::RemoteFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
