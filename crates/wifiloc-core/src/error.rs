use thiserror::Error;

use crate::ap::InvalidApId;
use crate::cache::CacheError;
use crate::refresh::RefreshError;
use crate::resolver::ResolverError;

/// Any failure surfaced by the caller-facing API.
#[derive(Error, Debug)]
pub enum LocateError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    InvalidApId(#[from] InvalidApId),
}

impl LocateError {
    /// True when the component was torn down and must be recreated.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            LocateError::Cache(CacheError::Closed) | LocateError::Refresh(RefreshError::Closed)
        )
    }
}
