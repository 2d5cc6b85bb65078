//! Smart Bookmarks Core Library
//!
//! Bookmark model, input validation, the remote store contract and the
//! live synchronization core shared by Smart Bookmarks front ends.

pub mod models;
pub mod store;
pub mod sync;
pub mod validate;

pub use models::{Bookmark, BookmarkCandidate, NewBookmark};
pub use store::{
    FeedEvent, HostedConfig, HostedStore, MemoryStore, Operation, RemoteStore, StoreError,
    Subscription, SubscriptionId,
};
pub use sync::{SyncCore, SyncError, SyncHandle, SyncOptions, SyncState, SyncView};
pub use validate::{normalize_url, ValidationError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
