//! Remote store contract.
//!
//! The hosted service owns persistence and authentication. The sync core
//! only needs the five capabilities below: a full fetch scoped to one owner,
//! insert, delete, and a change feed that can be opened and closed.
//!
//! Change-feed deliveries arrive as [`FeedEvent`] messages on a channel
//! rather than callbacks, so the consumer decides when to apply them.

mod hosted;
mod memory;
mod realtime;

use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{Bookmark, NewBookmark};

pub use hosted::{HostedConfig, HostedStore};
pub use memory::{MemoryStore, Operation};
pub use realtime::{decode_change, PhoenixMessage, CHANNEL_TOPIC};

/// Failure reported by the remote store, carrying its description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StoreError(String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// A change pushed by the store for rows matching a subscription's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Inserted(Bookmark),
    Deleted(String),
}

/// Identifies an open subscription for [`RemoteStore::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open change feed. The receiver yields `None` once the store stops
/// delivering, whether through `unsubscribe` or a dropped connection.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<FeedEvent>,
}

/// Capabilities of the hosted bookmark table.
pub trait RemoteStore: Send + Sync + 'static {
    /// All bookmarks owned by `owner_id`, newest first.
    fn fetch_all(
        &self,
        owner_id: &str,
    ) -> impl Future<Output = Result<Vec<Bookmark>, StoreError>> + Send;

    /// Inserts a row. The store assigns `id` and `created_at`.
    fn insert(&self, bookmark: &NewBookmark)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Opens a change feed for inserts and deletes of `owner_id`'s rows.
    fn subscribe(
        &self,
        owner_id: &str,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send;

    /// Closes a feed opened by [`RemoteStore::subscribe`]. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId) -> impl Future<Output = ()> + Send;
}
