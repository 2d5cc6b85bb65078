//! In-process bookmark store.
//!
//! Behaves like the hosted table: ids and timestamps are assigned on insert,
//! fetches are owner-scoped and newest first, and every insert or delete is
//! fanned out to the owner's open feeds. Individual operations can be made to
//! fail once or held until released, which is what the sync tests use to
//! exercise optimistic and compensating paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::{FeedEvent, RemoteStore, StoreError, Subscription, SubscriptionId};
use crate::models::{Bookmark, NewBookmark};

/// Store operations, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Fetch,
    Insert,
    Delete,
    Subscribe,
    Unsubscribe,
}

struct Subscriber {
    owner_id: String,
    sender: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct Inner {
    rows: Vec<Bookmark>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    failures: HashMap<Operation, String>,
    gates: HashMap<Operation, Arc<Semaphore>>,
    calls: HashMap<Operation, usize>,
}

impl Inner {
    fn notify(&self, owner_id: &str, event: FeedEvent) {
        for subscriber in self.subscribers.values() {
            if subscriber.owner_id == owner_id {
                // Receiver may already be gone; the entry stays until unsubscribe.
                let _ = subscriber.sender.send(event.clone());
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `rows`.
    pub fn with_rows(rows: Vec<Bookmark>) -> Self {
        let store = Self::new();
        store.lock().rows = rows;
        store
    }

    /// Every stored row, in insertion order.
    pub fn rows(&self) -> Vec<Bookmark> {
        self.lock().rows.clone()
    }

    /// Makes the next call of `operation` fail with `message`.
    pub fn fail_next(&self, operation: Operation, message: impl Into<String>) {
        self.lock().failures.insert(operation, message.into());
    }

    /// Blocks calls of `operation` until [`MemoryStore::release`].
    pub fn hold(&self, operation: Operation) {
        self.lock()
            .gates
            .insert(operation, Arc::new(Semaphore::new(0)));
    }

    /// Lets held and future calls of `operation` proceed.
    pub fn release(&self, operation: Operation) {
        if let Some(gate) = self.lock().gates.remove(&operation) {
            gate.close();
        }
    }

    /// Number of times `operation` has been invoked.
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Pushes `event` to every open feed of `owner_id` without touching the
    /// rows, as another device's change or a duplicate delivery would.
    pub fn emit(&self, owner_id: &str, event: FeedEvent) {
        self.lock().notify(owner_id, event);
    }

    /// Drops every feed's sender so subscribers see their stream end. The
    /// registrations stay until unsubscribed.
    pub fn drop_feeds(&self) {
        let mut inner = self.lock();
        for subscriber in inner.subscribers.values_mut() {
            let (closed, _) = mpsc::unbounded_channel();
            subscriber.sender = closed;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn begin(&self, operation: Operation) -> Result<(), StoreError> {
        let gate = {
            let mut inner = self.lock();
            *inner.calls.entry(operation).or_default() += 1;
            inner.gates.get(&operation).cloned()
        };

        if let Some(gate) = gate {
            // Released gates are closed, which ends the wait.
            let _ = gate.acquire().await;
        }

        let failure = self.lock().failures.remove(&operation);
        match failure {
            Some(message) => Err(StoreError::new(message)),
            None => Ok(()),
        }
    }
}

impl RemoteStore for MemoryStore {
    async fn fetch_all(&self, owner_id: &str) -> Result<Vec<Bookmark>, StoreError> {
        self.begin(Operation::Fetch).await?;

        let mut rows: Vec<Bookmark> = self
            .lock()
            .rows
            .iter()
            .filter(|b| b.owner_id == owner_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn insert(&self, bookmark: &NewBookmark) -> Result<(), StoreError> {
        self.begin(Operation::Insert).await?;

        let row = Bookmark {
            id: Uuid::new_v4().to_string(),
            owner_id: bookmark.owner_id.clone(),
            title: bookmark.title.clone(),
            url: bookmark.url.clone(),
            created_at: Utc::now(),
        };

        let mut inner = self.lock();
        inner.rows.push(row.clone());
        inner.notify(&row.owner_id, FeedEvent::Inserted(row.clone()));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.begin(Operation::Delete).await?;

        let mut inner = self.lock();
        if let Some(pos) = inner.rows.iter().position(|b| b.id == id) {
            let removed = inner.rows.remove(pos);
            inner.notify(&removed.owner_id, FeedEvent::Deleted(removed.id));
        }
        Ok(())
    }

    async fn subscribe(&self, owner_id: &str) -> Result<Subscription, StoreError> {
        self.begin(Operation::Subscribe).await?;

        let (sender, events) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();
        self.lock().subscribers.insert(
            id,
            Subscriber {
                owner_id: owner_id.to_string(),
                sender,
            },
        );
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.lock();
        *inner.calls.entry(Operation::Unsubscribe).or_default() += 1;
        inner.subscribers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn row(id: &str, owner: &str, minutes: i64) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            owner_id: owner.to_string(),
            title: format!("Bookmark {}", id),
            url: format!("https://example.com/{}", id),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minutes),
        }
    }

    #[tokio::test]
    async fn test_fetch_is_owner_scoped_and_newest_first() {
        let store = MemoryStore::with_rows(vec![
            row("a", "alice", 1),
            row("b", "bob", 2),
            row("c", "alice", 3),
        ]);

        let rows = store.fetch_all("alice").await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_insert_assigns_fields_and_notifies_owner_feed() {
        let store = MemoryStore::new();
        let mut alice = store.subscribe("alice").await.unwrap();
        let mut bob = store.subscribe("bob").await.unwrap();

        store
            .insert(&NewBookmark {
                title: "Rust".to_string(),
                url: "https://rust-lang.org".to_string(),
                owner_id: "alice".to_string(),
            })
            .await
            .unwrap();

        match alice.events.recv().await {
            Some(FeedEvent::Inserted(b)) => {
                assert!(!b.id.is_empty());
                assert_eq!(b.title, "Rust");
            }
            other => panic!("Expected insert event, got {:?}", other),
        }
        assert!(bob.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_notifies_and_absent_id_is_ok() {
        let store = MemoryStore::with_rows(vec![row("a", "alice", 1)]);
        let mut feed = store.subscribe("alice").await.unwrap();

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();

        assert_eq!(
            feed.events.recv().await,
            Some(FeedEvent::Deleted("a".to_string()))
        );
        assert!(feed.events.try_recv().is_err());
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_fails_once() {
        let store = MemoryStore::with_rows(vec![row("a", "alice", 1)]);
        store.fail_next(Operation::Delete, "permission denied");

        let err = store.delete("a").await.unwrap_err();
        assert_eq!(err.message(), "permission denied");
        assert_eq!(store.rows().len(), 1);

        store.delete("a").await.unwrap();
        assert!(store.rows().is_empty());
        assert_eq!(store.calls(Operation::Delete), 2);
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let store = Arc::new(MemoryStore::with_rows(vec![row("a", "alice", 1)]));
        store.hold(Operation::Fetch);

        let task = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.fetch_all("alice").await })
        };
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        store.release(Operation::Fetch);
        assert_eq!(task.await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe("alice").await.unwrap();
        assert_eq!(store.active_subscriptions(), 1);

        store.unsubscribe(feed.id).await;
        assert_eq!(store.active_subscriptions(), 0);
        assert_eq!(feed.events.recv().await, None);
    }
}
