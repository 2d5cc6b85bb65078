//! Live synchronization of one owner's bookmarks.
//!
//! A single background task owns the collection. It combines a full fetch
//! with the store's change feed, hides deletes optimistically until the store
//! confirms them, and refetches when a delete is refused.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use smartmarks_core::{BookmarkCandidate, MemoryStore, SyncCore, SyncOptions};
//!
//! # async fn demo() -> Result<(), smartmarks_core::SyncError> {
//! let handle = SyncCore::spawn(Arc::new(MemoryStore::new()), SyncOptions::default());
//! handle.initialize("user-42").await?;
//! handle
//!     .add_bookmark(BookmarkCandidate::new("Rust", "rust-lang.org"))
//!     .await?;
//! println!("{} bookmarks", handle.view().bookmarks.len());
//! # Ok(())
//! # }
//! ```

mod core;
mod error;
mod state;

pub use self::core::{SyncCore, SyncHandle, SyncOptions, DEFAULT_REQUEST_TIMEOUT};
pub use error::SyncError;
pub use state::{FetchOutcome, FetchTicket, SyncState, SyncView};
