//! The sync task and its handle.
//!
//! One task owns the [`SyncState`] and serves three inputs from a single
//! `select!` loop: commands from [`SyncHandle`]s, events from the open change
//! feed, and completions of remote requests it has issued. Each input is
//! handled to completion before the next is taken, so fetch results, feed
//! events and optimistic deletes never interleave. Requests are polled by
//! the loop itself, which keeps feed events flowing while they are in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use super::error::SyncError;
use super::state::{FetchOutcome, FetchTicket, SyncState, SyncView};
use crate::models::{Bookmark, BookmarkCandidate};
use crate::store::{FeedEvent, RemoteStore, StoreError, Subscription};
use crate::validate::ValidationError;

/// Default upper bound for a single store request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Upper bound for each fetch, insert, delete, subscribe and unsubscribe
    pub request_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type Reply = oneshot::Sender<Result<(), SyncError>>;

/// Caller waiting on one fetch. `feed_error` is reported instead of success
/// when the session's change feed could not be opened.
struct FetchWaiter {
    seq: u64,
    reply: Reply,
    feed_error: Option<SyncError>,
}

enum Command {
    Initialize { owner_id: String, reply: Reply },
    AddBookmark { candidate: BookmarkCandidate, reply: Reply },
    DeleteBookmark { id: String, reply: Reply },
    Refetch { reply: Reply },
    Teardown { reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

enum Completion {
    Fetch {
        ticket: FetchTicket,
        result: Result<Vec<Bookmark>, StoreError>,
    },
    Insert {
        result: Result<(), StoreError>,
        reply: Reply,
    },
    Delete {
        epoch: u64,
        id: String,
        result: Result<(), StoreError>,
        reply: Reply,
    },
}

/// Owner of one session's bookmark state. Created with [`SyncCore::spawn`]
/// and driven entirely through the returned [`SyncHandle`].
pub struct SyncCore<S: RemoteStore> {
    store: Arc<S>,
    options: SyncOptions,
    state: SyncState,
    feed: Option<Subscription>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    fetch_waiters: Vec<FetchWaiter>,
    view: watch::Sender<SyncView>,
}

impl<S: RemoteStore> SyncCore<S> {
    /// Starts the sync task on the current tokio runtime.
    ///
    /// The task stops after [`SyncHandle::shutdown`] or once every handle
    /// has been dropped, closing the change feed on the way out.
    pub fn spawn(store: Arc<S>, options: SyncOptions) -> SyncHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(SyncView::default());

        let core = Self {
            store,
            options,
            state: SyncState::new(),
            feed: None,
            in_flight: FuturesUnordered::new(),
            fetch_waiters: Vec::new(),
            view: view_tx,
        };
        tokio::spawn(core.run(commands_rx));

        SyncHandle {
            commands: commands_tx,
            view: view_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                event = next_feed_event(&mut self.feed), if self.feed.is_some() => match event {
                    Some(event) => self.apply_feed_event(event),
                    None => self.feed_lost().await,
                },
                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.handle_completion(completion);
                }
            }
        }
        tracing::debug!("sync task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { owner_id, reply } => self.initialize(owner_id, reply).await,
            Command::AddBookmark { candidate, reply } => self.add_bookmark(candidate, reply),
            Command::DeleteBookmark { id, reply } => self.delete_bookmark(id, reply),
            Command::Refetch { reply } => self.start_fetch(Some(reply), None),
            Command::Teardown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            // Intercepted by `run`.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn initialize(&mut self, owner_id: String, reply: Reply) {
        if owner_id.trim().is_empty() {
            let _ = reply.send(Err(ValidationError::MissingOwner.into()));
            return;
        }

        self.close_feed().await;
        let epoch = self.state.begin_session(&owner_id);
        tracing::info!(owner_id = %owner_id, epoch, "starting bookmark session");
        // Readers must not see the previous owner's rows while subscribing.
        self.publish();

        let feed_error = self.open_feed(&owner_id).await.err();
        self.start_fetch(Some(reply), feed_error);
    }

    fn add_bookmark(&mut self, candidate: BookmarkCandidate, reply: Reply) {
        let Some(owner_id) = self.state.owner_id() else {
            let _ = reply.send(Err(SyncError::NotInitialized));
            return;
        };

        let bookmark = match candidate.validate(owner_id) {
            Ok(bookmark) => bookmark,
            Err(e) => {
                tracing::debug!("rejected bookmark candidate: {}", e);
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        // The collection is left alone; the feed echo delivers the stored row.
        tracing::debug!(url = %bookmark.url, "inserting bookmark");
        let store = Arc::clone(&self.store);
        let limit = self.options.request_timeout;
        self.in_flight.push(Box::pin(async move {
            let result = bounded(limit, store.insert(&bookmark)).await;
            Completion::Insert { result, reply }
        }));
    }

    fn delete_bookmark(&mut self, id: String, reply: Reply) {
        if self.state.owner_id().is_none() {
            let _ = reply.send(Err(SyncError::NotInitialized));
            return;
        }

        self.state.mark_pending_delete(&id);
        self.publish();

        tracing::debug!(id = %id, "deleting bookmark");
        let epoch = self.state.epoch();
        let store = Arc::clone(&self.store);
        let limit = self.options.request_timeout;
        self.in_flight.push(Box::pin(async move {
            let result = bounded(limit, store.delete(&id)).await;
            Completion::Delete {
                epoch,
                id,
                result,
                reply,
            }
        }));
    }

    /// Issues a full fetch for the current owner. `waiter` is resolved with
    /// the fetch's outcome once it settles, or with `feed_error` if the fetch
    /// itself succeeded.
    fn start_fetch(&mut self, waiter: Option<Reply>, feed_error: Option<SyncError>) {
        let Some(owner_id) = self.state.owner_id().map(str::to_owned) else {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(SyncError::NotInitialized));
            }
            return;
        };

        let ticket = self.state.begin_fetch();
        if let Some(reply) = waiter {
            self.fetch_waiters.push(FetchWaiter {
                seq: ticket.seq(),
                reply,
                feed_error,
            });
        }

        let store = Arc::clone(&self.store);
        let limit = self.options.request_timeout;
        self.in_flight.push(Box::pin(async move {
            let result = bounded(limit, store.fetch_all(&owner_id)).await;
            Completion::Fetch { ticket, result }
        }));
        self.publish();
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetch { ticket, result } => {
                let outcome = self.state.complete_fetch(ticket, result);
                let response = match &outcome {
                    FetchOutcome::Applied => {
                        tracing::debug!(
                            count = self.state.bookmarks().len(),
                            "fetched bookmarks"
                        );
                        Ok(())
                    }
                    FetchOutcome::Outdated => Ok(()),
                    FetchOutcome::Failed(message) => {
                        tracing::warn!("bookmark fetch failed: {}", message);
                        Err(SyncError::Remote(message.clone()))
                    }
                    FetchOutcome::Stale => {
                        tracing::debug!(epoch = ticket.epoch(), "discarding stale fetch");
                        Err(SyncError::Superseded)
                    }
                };
                self.resolve_fetch_waiters(ticket.seq(), response);
                self.publish();
            }
            Completion::Insert { result, reply } => {
                if let Err(e) = &result {
                    tracing::warn!("bookmark insert failed: {}", e);
                }
                let _ = reply.send(result.map_err(SyncError::from));
            }
            Completion::Delete {
                epoch,
                id,
                result,
                reply,
            } => {
                if epoch != self.state.epoch() {
                    let _ = reply.send(result.map_err(SyncError::from));
                    return;
                }

                match result {
                    Ok(()) => {
                        self.state.resolve_delete(&id, true);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        tracing::warn!(id = %id, "bookmark delete failed, resynchronizing: {}", e);
                        self.state.resolve_delete(&id, false);
                        self.start_fetch(None, None);
                        let _ = reply.send(Err(e.into()));
                    }
                }
                self.publish();
            }
        }
    }

    fn resolve_fetch_waiters(&mut self, seq: u64, response: Result<(), SyncError>) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fetch_waiters)
            .into_iter()
            .partition(|waiter| waiter.seq == seq);
        self.fetch_waiters = waiting;

        for waiter in ready {
            let reply = match (&response, waiter.feed_error) {
                (Ok(()), Some(feed_error)) => Err(feed_error),
                (response, _) => response.clone(),
            };
            let _ = waiter.reply.send(reply);
        }
    }

    fn apply_feed_event(&mut self, event: FeedEvent) {
        let changed = match event {
            FeedEvent::Inserted(bookmark) => {
                tracing::debug!(id = %bookmark.id, "feed insert");
                self.state.reconcile_insert(bookmark)
            }
            FeedEvent::Deleted(id) => {
                tracing::debug!(id = %id, "feed delete");
                self.state.reconcile_delete(&id)
            }
        };
        if changed {
            self.publish();
        }
    }

    async fn open_feed(&mut self, owner_id: &str) -> Result<(), SyncError> {
        let limit = self.options.request_timeout;
        match bounded(limit, self.store.subscribe(owner_id)).await {
            Ok(subscription) => {
                tracing::debug!(subscription = %subscription.id, "change feed open");
                self.feed = Some(subscription);
                self.state.set_live(true);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("could not open change feed: {}", e);
                self.state.set_live(false);
                Err(SyncError::Subscription(e.message().to_string()))
            }
        }
    }

    /// Unsubscribes the open feed, if any. Taking the subscription out first
    /// guarantees each one is closed exactly once.
    async fn close_feed(&mut self) {
        if let Some(subscription) = self.feed.take() {
            let id = subscription.id;
            drop(subscription);
            if timeout(self.options.request_timeout, self.store.unsubscribe(id))
                .await
                .is_err()
            {
                tracing::warn!(subscription = %id, "unsubscribe timed out");
            }
            self.state.set_live(false);
        }
    }

    async fn feed_lost(&mut self) {
        tracing::warn!("change feed closed; updates from other devices stop until refetch");
        self.close_feed().await;
        self.publish();
    }

    async fn teardown(&mut self) {
        self.close_feed().await;
        if self.state.owner_id().is_some() {
            tracing::info!("ending bookmark session");
        }
        self.state.end_session();

        let waiters = std::mem::take(&mut self.fetch_waiters);
        for waiter in waiters {
            let _ = waiter.reply.send(Err(SyncError::Superseded));
        }
        self.publish();
    }

    fn publish(&self) {
        self.view.send_replace(self.state.view());
    }
}

async fn next_feed_event(feed: &mut Option<Subscription>) -> Option<FeedEvent> {
    match feed {
        Some(subscription) => subscription.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Runs `request`, turning an elapsed `limit` into a store error.
async fn bounded<T>(
    limit: Duration,
    request: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::new(format!(
            "request timed out after {:?}",
            limit
        ))),
    }
}

/// Cloneable front end of a running [`SyncCore`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SyncView>,
}

impl SyncHandle {
    /// Current snapshot of the collection, loading flag and last error.
    pub fn view(&self) -> SyncView {
        self.view.borrow().clone()
    }

    /// Receiver notified after every state change.
    pub fn watch(&self) -> watch::Receiver<SyncView> {
        self.view.clone()
    }

    /// Waits until no fetch is outstanding and returns that snapshot.
    pub async fn settled(&self) -> Result<SyncView, SyncError> {
        let mut view = self.view.clone();
        let settled = view
            .wait_for(|v| !v.loading)
            .await
            .map_err(|_| SyncError::Closed)?;
        Ok(settled.clone())
    }

    /// Starts a session for `owner_id`: closes any previous feed, opens a
    /// new one and fetches the owner's bookmarks. Resolves when that fetch
    /// settles. A failed fetch is also recorded in the view's `last_error`.
    pub async fn initialize(&self, owner_id: impl Into<String>) -> Result<(), SyncError> {
        let owner_id = owner_id.into();
        self.request(|reply| Command::Initialize { owner_id, reply })
            .await?
    }

    /// Validates and inserts a bookmark. The new row appears once the
    /// change feed delivers it.
    pub async fn add_bookmark(&self, candidate: BookmarkCandidate) -> Result<(), SyncError> {
        self.request(|reply| Command::AddBookmark { candidate, reply })
            .await?
    }

    /// Removes `id` from the view immediately, then deletes it remotely. On
    /// failure a full refetch is started and the store's error returned.
    pub async fn delete_bookmark(&self, id: impl Into<String>) -> Result<(), SyncError> {
        let id = id.into();
        self.request(|reply| Command::DeleteBookmark { id, reply })
            .await?
    }

    /// Forces a full resynchronization and resolves with its outcome.
    pub async fn refetch(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Refetch { reply }).await?
    }

    /// Closes the change feed and clears the session.
    pub async fn teardown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Teardown { reply }).await
    }

    /// Tears down the session and stops the sync task.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)
    }
}
