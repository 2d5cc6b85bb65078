//! Bookmark state for one signed-in owner.
//!
//! Two layers are kept apart:
//! - *confirmed* rows, as last reported by a full fetch or the change feed
//! - *pending deletes*, ids removed optimistically while the delete request
//!   is still in flight, or refused and waiting for a fetch to settle them
//!
//! The visible collection is the confirmed rows minus the pending deletes.
//! A refused delete is not rolled back locally: the row stays hidden until a
//! fetch issued after the refusal is applied, and that fetch decides.
//! All reconciliation is idempotent, so a feed echo of a local mutation can
//! arrive before or after the mutation's own response with the same result.

use std::collections::{HashMap, HashSet};

use crate::models::Bookmark;
use crate::store::{FeedEvent, StoreError};

/// Read-only snapshot handed to presentation code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncView {
    pub owner_id: Option<String>,
    pub bookmarks: Vec<Bookmark>,
    pub loading: bool,
    pub last_error: Option<String>,
    /// Whether the change feed is currently open
    pub live: bool,
    pub pending_deletes: usize,
}

impl SyncView {
    pub fn contains(&self, id: &str) -> bool {
        self.bookmarks.iter().any(|b| b.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.bookmarks.iter().map(|b| b.id.as_str()).collect()
    }
}

/// Identifies an issued fetch so its response can be matched to the session
/// and ordering it was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    epoch: u64,
    seq: u64,
    journal_start: usize,
}

impl FetchTicket {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// What happened to a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Rows replaced the confirmed collection
    Applied,
    /// A later fetch of the same session was already applied
    Outdated,
    /// The fetch failed; the collection is unchanged
    Failed(String),
    /// The session changed after the fetch was issued
    Stale,
}

#[derive(Debug, Default)]
pub struct SyncState {
    owner_id: Option<String>,
    /// Bumped whenever the session starts or ends.
    epoch: u64,
    confirmed: Vec<Bookmark>,
    pending_deletes: HashSet<String>,
    /// Refused deletes, keyed by the last fetch seq issued before the refusal.
    refused_deletes: HashMap<String, u64>,
    last_error: Option<String>,
    live: bool,
    next_fetch: u64,
    applied_fetch: Option<u64>,
    outstanding_fetches: usize,
    /// Feed changes seen while a fetch is outstanding, replayed over its rows.
    journal: Vec<FeedEvent>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_loading(&self) -> bool {
        self.outstanding_fetches > 0
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    /// Starts a session for `owner_id` and returns its epoch. Switching to a
    /// different owner drops the previous owner's rows and error.
    pub fn begin_session(&mut self, owner_id: &str) -> u64 {
        if self.owner_id.as_deref() != Some(owner_id) {
            self.confirmed.clear();
            self.last_error = None;
            self.applied_fetch = None;
        }
        self.owner_id = Some(owner_id.to_string());
        self.epoch += 1;
        self.pending_deletes.clear();
        self.refused_deletes.clear();
        self.outstanding_fetches = 0;
        self.journal.clear();
        self.live = false;
        self.epoch
    }

    pub fn end_session(&mut self) {
        self.owner_id = None;
        self.epoch += 1;
        self.confirmed.clear();
        self.pending_deletes.clear();
        self.refused_deletes.clear();
        self.last_error = None;
        self.live = false;
        self.applied_fetch = None;
        self.outstanding_fetches = 0;
        self.journal.clear();
    }

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.outstanding_fetches += 1;
        self.next_fetch += 1;
        FetchTicket {
            epoch: self.epoch,
            seq: self.next_fetch,
            journal_start: self.journal.len(),
        }
    }

    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<Vec<Bookmark>, StoreError>,
    ) -> FetchOutcome {
        if ticket.epoch != self.epoch {
            return FetchOutcome::Stale;
        }
        self.outstanding_fetches = self.outstanding_fetches.saturating_sub(1);

        let superseded = self.applied_fetch.is_some_and(|seq| seq > ticket.seq);
        let outcome = match result {
            _ if superseded => FetchOutcome::Outdated,
            Err(e) => {
                self.last_error = Some(e.message().to_string());
                FetchOutcome::Failed(e.message().to_string())
            }
            Ok(rows) => {
                self.replace_confirmed(rows);
                let replay = self
                    .journal
                    .get(ticket.journal_start..)
                    .unwrap_or_default()
                    .to_vec();
                for event in replay {
                    self.apply(event);
                }
                self.applied_fetch = Some(ticket.seq);
                self.refused_deletes.retain(|_, issued| *issued >= ticket.seq);
                self.last_error = None;
                FetchOutcome::Applied
            }
        };

        if self.outstanding_fetches == 0 {
            self.journal.clear();
        }
        outcome
    }

    /// Applies a feed insert. Returns whether the collection changed.
    pub fn reconcile_insert(&mut self, bookmark: Bookmark) -> bool {
        if !self.owns(&bookmark) {
            tracing::debug!(id = %bookmark.id, "ignoring insert for another owner");
            return false;
        }
        self.record(FeedEvent::Inserted(bookmark.clone()));
        self.apply_insert(bookmark)
    }

    /// Applies a feed delete. Returns whether the collection changed.
    pub fn reconcile_delete(&mut self, id: &str) -> bool {
        self.record(FeedEvent::Deleted(id.to_string()));
        self.apply_delete(id)
    }

    /// Hides `id` until [`SyncState::resolve_delete`] is called for it.
    pub fn mark_pending_delete(&mut self, id: &str) -> bool {
        self.pending_deletes.insert(id.to_string())
    }

    /// Settles an optimistic delete. On success the row is dropped from the
    /// confirmed layer. On failure it stays hidden until a fetch issued after
    /// this call is applied.
    pub fn resolve_delete(&mut self, id: &str, succeeded: bool) {
        self.pending_deletes.remove(id);
        if succeeded {
            self.refused_deletes.remove(id);
            self.record(FeedEvent::Deleted(id.to_string()));
            self.apply_delete(id);
        } else {
            self.refused_deletes.insert(id.to_string(), self.next_fetch);
        }
    }

    /// The visible collection.
    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.confirmed
            .iter()
            .filter(|b| !self.is_hidden(&b.id))
            .cloned()
            .collect()
    }

    pub fn view(&self) -> SyncView {
        SyncView {
            owner_id: self.owner_id.clone(),
            bookmarks: self.bookmarks(),
            loading: self.is_loading(),
            last_error: self.last_error.clone(),
            live: self.live,
            pending_deletes: self.pending_deletes.len()
                + self
                    .refused_deletes
                    .keys()
                    .filter(|id| !self.pending_deletes.contains(*id))
                    .count(),
        }
    }

    fn is_hidden(&self, id: &str) -> bool {
        self.pending_deletes.contains(id) || self.refused_deletes.contains_key(id)
    }

    fn owns(&self, bookmark: &Bookmark) -> bool {
        self.owner_id.as_deref() == Some(bookmark.owner_id.as_str())
    }

    fn record(&mut self, event: FeedEvent) {
        if self.outstanding_fetches > 0 {
            self.journal.push(event);
        }
    }

    fn apply(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Inserted(bookmark) => {
                self.apply_insert(bookmark);
            }
            FeedEvent::Deleted(id) => {
                self.apply_delete(&id);
            }
        }
    }

    fn apply_insert(&mut self, bookmark: Bookmark) -> bool {
        if self.confirmed.iter().any(|b| b.id == bookmark.id) {
            return false;
        }
        self.confirmed.insert(0, bookmark);
        true
    }

    fn apply_delete(&mut self, id: &str) -> bool {
        let before = self.confirmed.len();
        self.confirmed.retain(|b| b.id != id);
        self.confirmed.len() != before
    }

    /// Replaces the confirmed rows, keeping only this owner's rows and the
    /// first occurrence of each id.
    fn replace_confirmed(&mut self, rows: Vec<Bookmark>) {
        let owner = self.owner_id.clone();
        let mut seen = HashSet::new();
        self.confirmed = rows
            .into_iter()
            .filter(|b| owner.as_deref() == Some(b.owner_id.as_str()))
            .filter(|b| seen.insert(b.id.clone()))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn bookmark(id: &str, owner: &str, minutes: i64) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            owner_id: owner.to_string(),
            title: format!("Bookmark {}", id),
            url: format!("https://example.com/{}", id),
            created_at: at(minutes),
        }
    }

    fn loaded(owner: &str, rows: Vec<Bookmark>) -> SyncState {
        let mut state = SyncState::new();
        state.begin_session(owner);
        let ticket = state.begin_fetch();
        assert_eq!(state.complete_fetch(ticket, Ok(rows)), FetchOutcome::Applied);
        state
    }

    fn ids(state: &SyncState) -> Vec<String> {
        state.bookmarks().into_iter().map(|b| b.id).collect()
    }

    #[test]
    fn test_feed_insert_is_prepended_not_sorted() {
        let mut state = loaded("u", vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]);

        assert!(state.reconcile_insert(bookmark("3", "u", 3)));
        assert_eq!(ids(&state), vec!["3", "1", "2"]);

        // An older row arriving late is still prepended.
        assert!(state.reconcile_insert(bookmark("0", "u", 0)));
        assert_eq!(ids(&state), vec!["0", "3", "1", "2"]);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1)]);

        assert!(state.reconcile_insert(bookmark("2", "u", 2)));
        assert!(!state.reconcile_insert(bookmark("2", "u", 2)));
        assert!(!state.reconcile_insert(bookmark("1", "u", 1)));
        assert_eq!(ids(&state), vec!["2", "1"]);
    }

    #[test]
    fn test_delete_of_absent_id_is_noop() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1)]);
        let before = state.view();

        assert!(!state.reconcile_delete("missing"));
        assert_eq!(state.view(), before);

        assert!(state.reconcile_delete("1"));
        assert!(!state.reconcile_delete("1"));
        assert!(state.bookmarks().is_empty());
    }

    #[test]
    fn test_other_owner_never_enters_collection() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1), bookmark("x", "other", 2)]);
        assert_eq!(ids(&state), vec!["1"]);

        assert!(!state.reconcile_insert(bookmark("y", "other", 3)));
        assert_eq!(ids(&state), vec!["1"]);
    }

    #[test]
    fn test_fetch_drops_duplicate_ids() {
        let state = loaded("u", vec![bookmark("1", "u", 2), bookmark("1", "u", 1)]);
        assert_eq!(state.bookmarks().len(), 1);
        assert_eq!(state.bookmarks()[0].created_at, at(2));
    }

    #[test]
    fn test_loading_tracks_outstanding_fetches() {
        let mut state = SyncState::new();
        state.begin_session("u");
        assert!(!state.is_loading());

        let ticket = state.begin_fetch();
        assert!(state.is_loading());
        state.complete_fetch(ticket, Ok(vec![]));
        assert!(!state.is_loading());
    }

    #[test]
    fn test_failed_fetch_keeps_collection_and_records_error() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1)]);

        let ticket = state.begin_fetch();
        let outcome = state.complete_fetch(ticket, Err(StoreError::new("JWT expired")));
        assert_eq!(outcome, FetchOutcome::Failed("JWT expired".to_string()));
        assert_eq!(state.last_error(), Some("JWT expired"));
        assert_eq!(ids(&state), vec!["1"]);
        assert!(!state.is_loading());

        let ticket = state.begin_fetch();
        state.complete_fetch(ticket, Ok(vec![bookmark("1", "u", 1)]));
        assert_eq!(state.last_error(), None);
    }

    #[test]
    fn test_pending_delete_hides_until_resolved() {
        let mut state = loaded("u", vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]);

        assert!(state.mark_pending_delete("1"));
        assert_eq!(ids(&state), vec!["2"]);
        assert_eq!(state.view().pending_deletes, 1);

        state.resolve_delete("1", true);
        assert_eq!(ids(&state), vec!["2"]);
        assert_eq!(state.view().pending_deletes, 0);
    }

    #[test]
    fn test_refused_delete_stays_hidden_until_refetch_decides() {
        let mut state = loaded("u", vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]);

        state.mark_pending_delete("1");
        state.resolve_delete("1", false);
        assert_eq!(ids(&state), vec!["2"]);
        assert_eq!(state.view().pending_deletes, 1);

        // The compensating fetch is authoritative when the row is gone.
        let ticket = state.begin_fetch();
        state.complete_fetch(ticket, Ok(vec![bookmark("2", "u", 1)]));
        assert_eq!(ids(&state), vec!["2"]);
        assert_eq!(state.view().pending_deletes, 0);
    }

    #[test]
    fn test_refused_delete_restored_by_refetch() {
        let mut state = loaded("u", vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]);

        state.mark_pending_delete("1");
        state.resolve_delete("1", false);

        let ticket = state.begin_fetch();
        state.complete_fetch(ticket, Ok(vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]));
        assert_eq!(ids(&state), vec!["1", "2"]);
    }

    #[test]
    fn test_refused_delete_survives_failed_refetch() {
        let mut state = loaded("u", vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]);

        state.mark_pending_delete("1");
        state.resolve_delete("1", false);

        let ticket = state.begin_fetch();
        state.complete_fetch(ticket, Err(StoreError::new("network down")));
        assert_eq!(ids(&state), vec!["2"]);
        assert_eq!(state.last_error(), Some("network down"));
    }

    #[test]
    fn test_fetch_issued_before_refusal_does_not_release_row() {
        let mut state = loaded("u", vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]);

        let earlier = state.begin_fetch();
        state.mark_pending_delete("1");
        state.resolve_delete("1", false);

        state.complete_fetch(earlier, Ok(vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]));
        assert_eq!(ids(&state), vec!["2"]);

        let later = state.begin_fetch();
        state.complete_fetch(later, Ok(vec![bookmark("1", "u", 2), bookmark("2", "u", 1)]));
        assert_eq!(ids(&state), vec!["1", "2"]);
    }

    #[test]
    fn test_failed_older_fetch_keeps_newer_data_error_free() {
        let mut state = SyncState::new();
        state.begin_session("u");
        let first = state.begin_fetch();
        let second = state.begin_fetch();

        state.complete_fetch(second, Ok(vec![bookmark("1", "u", 1)]));
        assert_eq!(
            state.complete_fetch(first, Err(StoreError::new("timeout"))),
            FetchOutcome::Outdated
        );
        assert_eq!(state.last_error(), None);
        assert_eq!(ids(&state), vec!["1"]);
    }

    #[test]
    fn test_feed_delete_echo_during_pending_delete() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1)]);

        state.mark_pending_delete("1");
        assert!(state.reconcile_delete("1"));
        state.resolve_delete("1", true);
        assert!(state.bookmarks().is_empty());
    }

    #[test]
    fn test_stale_fetch_after_owner_change_is_discarded() {
        let mut state = SyncState::new();
        state.begin_session("alice");
        let alice_fetch = state.begin_fetch();

        state.begin_session("bob");
        let bob_fetch = state.begin_fetch();

        assert_eq!(
            state.complete_fetch(alice_fetch, Ok(vec![bookmark("a", "alice", 1)])),
            FetchOutcome::Stale
        );
        assert!(state.bookmarks().is_empty());
        assert!(state.is_loading());

        assert_eq!(
            state.complete_fetch(bob_fetch, Ok(vec![bookmark("b", "bob", 1)])),
            FetchOutcome::Applied
        );
        assert_eq!(ids(&state), vec!["b"]);
    }

    #[test]
    fn test_owner_change_clears_previous_rows() {
        let mut state = loaded("alice", vec![bookmark("a", "alice", 1)]);
        state.begin_session("bob");
        assert!(state.bookmarks().is_empty());
        assert_eq!(state.owner_id(), Some("bob"));

        let mut same = loaded("alice", vec![bookmark("a", "alice", 1)]);
        same.begin_session("alice");
        assert_eq!(ids(&same), vec!["a"]);
    }

    #[test]
    fn test_older_fetch_does_not_overwrite_newer() {
        let mut state = SyncState::new();
        state.begin_session("u");
        let first = state.begin_fetch();
        let second = state.begin_fetch();

        assert_eq!(
            state.complete_fetch(second, Ok(vec![bookmark("2", "u", 2), bookmark("1", "u", 1)])),
            FetchOutcome::Applied
        );
        assert_eq!(
            state.complete_fetch(first, Ok(vec![bookmark("1", "u", 1)])),
            FetchOutcome::Outdated
        );
        assert_eq!(ids(&state), vec!["2", "1"]);
    }

    #[test]
    fn test_feed_changes_during_fetch_are_replayed() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1), bookmark("2", "u", 0)]);

        let ticket = state.begin_fetch();
        state.reconcile_insert(bookmark("3", "u", 3));
        state.reconcile_delete("2");

        // Snapshot taken before both changes.
        state.complete_fetch(ticket, Ok(vec![bookmark("1", "u", 1), bookmark("2", "u", 0)]));
        assert_eq!(ids(&state), vec!["3", "1"]);
    }

    #[test]
    fn test_successful_delete_during_fetch_survives_snapshot() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1)]);

        let ticket = state.begin_fetch();
        state.mark_pending_delete("1");
        state.resolve_delete("1", true);

        state.complete_fetch(ticket, Ok(vec![bookmark("1", "u", 1)]));
        assert!(state.bookmarks().is_empty());
    }

    #[test]
    fn test_end_session_clears_everything() {
        let mut state = loaded("u", vec![bookmark("1", "u", 1)]);
        let ticket = state.begin_fetch();
        state.set_live(true);

        state.end_session();
        assert_eq!(state.view(), SyncView::default());
        assert_eq!(
            state.complete_fetch(ticket, Ok(vec![bookmark("1", "u", 1)])),
            FetchOutcome::Stale
        );
    }
}
