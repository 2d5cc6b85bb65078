//! Sync error types.

use thiserror::Error;

use crate::store::StoreError;
use crate::validate::ValidationError;

/// Errors surfaced to callers of the sync core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Input failed local checks; nothing was sent to the store
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store rejected or failed the request
    #[error("{0}")]
    Remote(String),

    /// The live feed could not be opened
    #[error("Live updates unavailable: {0}")]
    Subscription(String),

    /// No owner session has been initialized
    #[error("No active session. Sign in first.")]
    NotInitialized,

    /// A fetch settled after its session was replaced or torn down
    #[error("Session changed before the request completed")]
    Superseded,

    /// The sync task has stopped
    #[error("Sync core is no longer running")]
    Closed,
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Remote(e.message().to_string())
    }
}
