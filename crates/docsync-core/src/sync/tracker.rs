//! Update state tracking
//!
//! Remembers the state id last acknowledged by the server, accumulates
//! local edits made since then and serializes the exchanges that move the
//! server forward.
//!
//! Edits are accumulated as a single [`PendingEdit`] span, so any number of
//! keystrokes between two exchanges become one delta. Exclusive operations
//! require an [`ExclusiveGuard`], obtained from [`UpdateStateTracker::lock`]
//! or [`UpdateStateTracker::acquire`]; waiters are served in arrival order.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::document::{DocumentError, DocumentSnapshot, DocumentSource, TextChange};
use crate::error::SyncResult;
use crate::transport::Delta;

/// The net effect of edits not yet acknowledged by the server
///
/// The server text `[from, old_to)` was replaced by the local text
/// `[from, new_to)`; everything outside that span is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEdit {
    pub from: usize,
    pub old_to: usize,
    pub new_to: usize,
}

impl PendingEdit {
    fn of(change: &TextChange) -> Self {
        Self {
            from: change.offset,
            old_to: change.removed_end(),
            new_to: change.offset + change.inserted_len(),
        }
    }

    /// Widen the span to also cover a replacement of `removed` chars at
    /// `offset` (in local coordinates) by `inserted` chars
    fn merge(self, offset: usize, removed: usize, inserted: usize) -> Self {
        let end = self.new_to.max(offset + removed);
        Self {
            from: self.from.min(offset),
            old_to: self.old_to + (end - self.new_to),
            new_to: end - removed + inserted,
        }
    }

    fn merge_change(self, change: &TextChange) -> Self {
        self.merge(change.offset, change.removed_len, change.inserted_len())
    }

    /// Compose with an edit made on top of this one's result
    fn compose(self, later: PendingEdit) -> Self {
        self.merge(
            later.from,
            later.old_to - later.from,
            later.new_to - later.from,
        )
    }

    /// Move the whole span by a change applied before it
    fn shifted(self, change: &TextChange) -> Self {
        let shift = |pos: usize| pos + change.inserted_len() - change.removed_len;
        Self {
            from: shift(self.from),
            old_to: shift(self.old_to),
            new_to: shift(self.new_to),
        }
    }

    pub fn replace_length(&self) -> usize {
        self.old_to - self.from
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    state_id: Option<String>,
    /// Edits nobody is sending yet
    dirty: Option<PendingEdit>,
    /// Edits sent by the current lock holder, awaiting acknowledgment
    in_flight: Option<PendingEdit>,
}

/// Result of [`UpdateStateTracker::acquire`]
pub enum Acquired<'a> {
    /// The lock is held; exclusive operations are available
    Locked(ExclusiveGuard<'a>),
    /// Another exchange is running but nothing is pending, so a read-only
    /// request may go out against `state_id` without waiting
    Bypass { state_id: String },
}

/// Tracks the agreement between the local document and the server
pub struct UpdateStateTracker {
    document: Arc<dyn DocumentSource>,
    state: Mutex<TrackerState>,
    lock: tokio::sync::Mutex<()>,
}

impl UpdateStateTracker {
    pub fn new(document: Arc<dyn DocumentSource>) -> Self {
        Self {
            document,
            state: Mutex::new(TrackerState::default()),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a local edit to the document and record it
    ///
    /// Returns whether a synchronization should be scheduled; a change that
    /// leaves the text as it was is not recorded.
    pub fn on_edit(&self, change: &TextChange) -> Result<bool, DocumentError> {
        let mut state = self.state();
        let snapshot = self.document.snapshot();
        if snapshot.slice(change.offset, change.removed_end())? == change.inserted.as_str() {
            trace!("Ignoring edit at {} without textual change", change.offset);
            return Ok(false);
        }
        self.document.apply(change)?;
        state.dirty = Some(match state.dirty {
            Some(dirty) => dirty.merge_change(change),
            None => PendingEdit::of(change),
        });
        Ok(true)
    }

    /// Whether the server lacks local edits or has no known state
    pub fn needs_update(&self) -> bool {
        let state = self.state();
        state.dirty.is_some() || state.state_id.is_none()
    }

    /// Whether any edit is unacknowledged, including one being sent
    pub fn has_pending_changes(&self) -> bool {
        let state = self.state();
        state.dirty.is_some() || state.in_flight.is_some()
    }

    pub fn state_id(&self) -> Option<String> {
        self.state().state_id.clone()
    }

    /// Edits that nobody is sending yet
    pub fn dirty(&self) -> Option<PendingEdit> {
        self.state().dirty
    }

    /// Whether an exclusive exchange is running
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Force the next exchange to send the full text
    pub fn invalidate_state_id(&self) {
        self.state().state_id = None;
    }

    /// Invalidate only if the server is still assumed to be at `state_id`
    pub fn invalidate_state_id_if(&self, state_id: &str) {
        let mut state = self.state();
        if state.state_id.as_deref() == Some(state_id) {
            state.state_id = None;
        }
    }

    /// Whether the document moved on since `state_id` was captured
    pub fn has_changes_since(&self, state_id: &str) -> bool {
        let state = self.state();
        state.state_id.as_deref() != Some(state_id)
            || state.dirty.is_some()
            || state.in_flight.is_some()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.document.snapshot()
    }

    /// Wait for exclusive access
    pub async fn lock(&self) -> ExclusiveGuard<'_> {
        let permit = self.lock.lock().await;
        ExclusiveGuard {
            tracker: self,
            _permit: permit,
        }
    }

    /// Take the lock, or skip it if `allow_bypass` is set and the server
    /// already has every local edit
    pub async fn acquire(&self, allow_bypass: bool) -> Acquired<'_> {
        if let Ok(permit) = self.lock.try_lock() {
            return Acquired::Locked(ExclusiveGuard {
                tracker: self,
                _permit: permit,
            });
        }
        if allow_bypass {
            let state = self.state();
            if state.dirty.is_none() && state.in_flight.is_none() {
                if let Some(state_id) = state.state_id.clone() {
                    return Acquired::Bypass { state_id };
                }
            }
        }
        Acquired::Locked(self.lock().await)
    }
}

/// Proof of exclusive access to the tracker
///
/// Dropping the guard releases the lock. An edit that was prepared but
/// never acknowledged is put back in front of newer edits, so it is sent
/// again by the next exchange.
pub struct ExclusiveGuard<'a> {
    tracker: &'a UpdateStateTracker,
    _permit: tokio::sync::MutexGuard<'a, ()>,
}

impl ExclusiveGuard<'_> {
    pub fn state_id(&self) -> Option<String> {
        self.tracker.state_id()
    }

    pub fn tracker(&self) -> &UpdateStateTracker {
        self.tracker
    }

    /// Take the accumulated edit as a delta against the current state id
    ///
    /// Returns `None` if there is nothing to send.
    pub fn prepare_delta_update(&mut self) -> SyncResult<Option<Delta>> {
        let mut state = self.tracker.state();
        let Some(dirty) = state.dirty.take() else {
            return Ok(None);
        };
        let pending = match state.in_flight.take() {
            Some(in_flight) => in_flight.compose(dirty),
            None => dirty,
        };
        let snapshot = self.tracker.document.snapshot();
        let delta_text = match snapshot.slice(pending.from, pending.new_to) {
            Ok(text) => text.to_string(),
            Err(e) => {
                state.dirty = Some(pending);
                return Err(e.into());
            }
        };
        state.in_flight = Some(pending);
        Ok(Some(Delta {
            delta_offset: pending.from,
            delta_replace_length: pending.replace_length(),
            delta_text,
        }))
    }

    /// Drop all delta bookkeeping and return the text to send in full
    pub fn prepare_full_text_update(&mut self) -> DocumentSnapshot {
        let mut state = self.tracker.state();
        state.dirty = None;
        state.in_flight = None;
        state.state_id = None;
        self.tracker.document.snapshot()
    }

    /// Record an acknowledged state id
    ///
    /// `remote` is a change the server applied on its side (formatting),
    /// in coordinates of the text it acknowledged. It is applied locally as
    /// part of the new baseline. If it overlaps an edit made meanwhile it
    /// is dropped and the state id invalidated instead.
    pub fn set_state_id(
        &mut self,
        state_id: String,
        remote: Option<&TextChange>,
    ) -> SyncResult<()> {
        let mut state = self.tracker.state();
        state.in_flight = None;
        state.state_id = Some(state_id);
        let Some(change) = remote else {
            return Ok(());
        };

        let result = match state.dirty {
            None => self.tracker.document.apply(change),
            Some(dirty) if change.removed_end() <= dirty.from => {
                let result = self.tracker.document.apply(change);
                if result.is_ok() {
                    state.dirty = Some(dirty.shifted(change));
                }
                result
            }
            Some(dirty) if change.offset >= dirty.old_to => {
                let local = TextChange::new(
                    change.offset - dirty.old_to + dirty.new_to,
                    change.removed_len,
                    change.inserted.clone(),
                );
                self.tracker.document.apply(&local)
            }
            Some(_) => {
                warn!("Remote change overlaps local edits, resynchronizing");
                state.state_id = None;
                Ok(())
            }
        };
        if let Err(e) = result {
            state.state_id = None;
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.tracker.state();
        if let Some(in_flight) = state.in_flight.take() {
            trace!("Restoring unacknowledged edit {:?}", in_flight);
            state.dirty = Some(match state.dirty.take() {
                Some(dirty) => in_flight.compose(dirty),
                None => in_flight,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SharedDocument;

    fn tracker(text: &str) -> (Arc<SharedDocument>, UpdateStateTracker) {
        let document = Arc::new(SharedDocument::new(text));
        let tracker = UpdateStateTracker::new(document.clone());
        (document, tracker)
    }

    /// Apply a delta the way the server does
    fn apply_delta(server: &str, delta: &Delta) -> String {
        let mut snapshot = DocumentSnapshot::new(server);
        snapshot
            .apply(&TextChange::new(
                delta.delta_offset,
                delta.delta_replace_length,
                delta.delta_text.clone(),
            ))
            .unwrap();
        snapshot.text.to_string()
    }

    async fn synced(tracker: &UpdateStateTracker) {
        let mut guard = tracker.lock().await;
        guard.prepare_full_text_update();
        guard.set_state_id("s0".to_string(), None).unwrap();
    }

    #[test]
    fn test_initial_state_needs_update() {
        let (_, tracker) = tracker("class A.");
        assert!(tracker.needs_update());
        assert!(!tracker.has_pending_changes());
        assert_eq!(tracker.state_id(), None);
    }

    #[test]
    fn test_no_op_edit_is_ignored() {
        let (document, tracker) = tracker("class A.");
        assert!(!tracker.on_edit(&TextChange::new(6, 1, "A")).unwrap());
        assert!(!tracker.on_edit(&TextChange::insert(3, "")).unwrap());
        assert_eq!(tracker.dirty(), None);
        assert_eq!(document.text(), "class A.");
    }

    #[test]
    fn test_out_of_bounds_edit_is_rejected() {
        let (_, tracker) = tracker("abc");
        assert!(tracker.on_edit(&TextChange::delete(2, 5)).is_err());
        assert_eq!(tracker.dirty(), None);
    }

    #[tokio::test]
    async fn test_insertions_merge_into_one_delta() {
        let (document, tracker) = tracker("class A.");
        synced(&tracker).await;

        for (offset, text) in [(7, "B"), (8, "C"), (9, "D")] {
            assert!(tracker.on_edit(&TextChange::insert(offset, text)).unwrap());
        }
        assert_eq!(document.text(), "class ABCD.");

        let mut guard = tracker.lock().await;
        let delta = guard.prepare_delta_update().unwrap().unwrap();
        assert_eq!(
            delta,
            Delta {
                delta_offset: 7,
                delta_replace_length: 0,
                delta_text: "BCD".to_string(),
            }
        );
        assert_eq!(apply_delta("class A.", &delta), document.text());
    }

    #[tokio::test]
    async fn test_scattered_edits_produce_equivalent_delta() {
        let (document, tracker) = tracker("hello world");
        synced(&tracker).await;

        tracker.on_edit(&TextChange::insert(5, ",")).unwrap();
        tracker.on_edit(&TextChange::delete(0, 1)).unwrap();
        tracker.on_edit(&TextChange::new(6, 5, "there")).unwrap();
        tracker.on_edit(&TextChange::insert(10, "!")).unwrap();
        assert_eq!(document.text(), "ello, ther!e");

        let mut guard = tracker.lock().await;
        let delta = guard.prepare_delta_update().unwrap().unwrap();
        assert_eq!(delta.delta_offset, 0);
        assert_eq!(apply_delta("hello world", &delta), document.text());
    }

    #[tokio::test]
    async fn test_multibyte_offsets_count_chars() {
        let (document, tracker) = tracker("αβγ");
        synced(&tracker).await;
        tracker.on_edit(&TextChange::new(1, 1, "δε")).unwrap();

        let mut guard = tracker.lock().await;
        let delta = guard.prepare_delta_update().unwrap().unwrap();
        assert_eq!(delta.delta_offset, 1);
        assert_eq!(delta.delta_replace_length, 1);
        assert_eq!(delta.delta_text, "δε");
        assert_eq!(apply_delta("αβγ", &delta), document.text());
    }

    #[tokio::test]
    async fn test_acknowledged_delta_clears_pending() {
        let (_, tracker) = tracker("class A.");
        synced(&tracker).await;
        tracker.on_edit(&TextChange::insert(8, "\n")).unwrap();

        let mut guard = tracker.lock().await;
        guard.prepare_delta_update().unwrap().unwrap();
        assert!(!tracker.needs_update());
        assert!(tracker.has_pending_changes());
        guard.set_state_id("s1".to_string(), None).unwrap();
        drop(guard);

        assert!(!tracker.has_pending_changes());
        assert_eq!(tracker.state_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_unacknowledged_delta_is_restored_before_newer_edits() {
        let (document, tracker) = tracker("abc");
        synced(&tracker).await;
        tracker.on_edit(&TextChange::insert(3, "d")).unwrap();

        {
            let mut guard = tracker.lock().await;
            guard.prepare_delta_update().unwrap().unwrap();
            // Edit arrives while the exchange is in flight, which then fails
            tracker.on_edit(&TextChange::insert(0, "z")).unwrap();
        }

        assert_eq!(tracker.state_id().as_deref(), Some("s0"));
        let mut guard = tracker.lock().await;
        let delta = guard.prepare_delta_update().unwrap().unwrap();
        assert_eq!(document.text(), "zabcd");
        assert_eq!(apply_delta("abc", &delta), "zabcd");
    }

    #[tokio::test]
    async fn test_full_text_update_discards_deltas() {
        let (_, tracker) = tracker("abc");
        synced(&tracker).await;
        tracker.on_edit(&TextChange::insert(0, "x")).unwrap();

        let mut guard = tracker.lock().await;
        let snapshot = guard.prepare_full_text_update();
        assert_eq!(snapshot.text, "xabc");
        assert_eq!(guard.state_id(), None);
        assert!(guard.prepare_delta_update().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_has_changes_since() {
        let (_, tracker) = tracker("abc");
        synced(&tracker).await;
        assert!(!tracker.has_changes_since("s0"));
        assert!(tracker.has_changes_since("other"));

        tracker.on_edit(&TextChange::insert(0, "x")).unwrap();
        assert!(tracker.has_changes_since("s0"));
    }

    #[tokio::test]
    async fn test_invalidate_state_id() {
        let (_, tracker) = tracker("abc");
        synced(&tracker).await;
        assert!(!tracker.needs_update());
        tracker.invalidate_state_id();
        assert!(tracker.needs_update());

        synced(&tracker).await;
        tracker.invalidate_state_id_if("stale");
        assert_eq!(tracker.state_id().as_deref(), Some("s0"));
        tracker.invalidate_state_id_if("s0");
        assert_eq!(tracker.state_id(), None);
    }

    #[tokio::test]
    async fn test_acquire_bypasses_only_when_nothing_is_pending() {
        let (_, tracker) = tracker("abc");
        synced(&tracker).await;

        let holder = tracker.lock().await;
        assert!(tracker.is_locked());
        match tracker.acquire(true).await {
            Acquired::Bypass { state_id } => assert_eq!(state_id, "s0"),
            Acquired::Locked(_) => panic!("expected bypass"),
        }

        tracker.on_edit(&TextChange::insert(0, "x")).unwrap();
        let waiter = tracker.acquire(true);
        tokio::pin!(waiter);
        assert!(futures_util::poll!(&mut waiter).is_pending());

        drop(holder);
        assert!(matches!(waiter.await, Acquired::Locked(_)));
        assert!(!tracker.is_locked());
    }

    #[tokio::test]
    async fn test_acquire_without_bypass_waits() {
        let (_, tracker) = tracker("abc");
        synced(&tracker).await;

        let holder = tracker.lock().await;
        let waiter = tracker.acquire(false);
        tokio::pin!(waiter);
        assert!(futures_util::poll!(&mut waiter).is_pending());
        drop(holder);
        assert!(matches!(waiter.await, Acquired::Locked(_)));
    }

    #[tokio::test]
    async fn test_remote_change_becomes_baseline() {
        let (document, tracker) = tracker("class  A .");
        synced(&tracker).await;

        let mut guard = tracker.lock().await;
        guard
            .set_state_id("s1".to_string(), Some(&TextChange::new(0, 10, "class A.")))
            .unwrap();
        drop(guard);

        assert_eq!(document.text(), "class A.");
        assert!(!tracker.needs_update());
        assert!(!tracker.has_pending_changes());
    }

    #[tokio::test]
    async fn test_remote_change_before_local_edit_shifts_it() {
        let (document, tracker) = tracker("a  b c");
        synced(&tracker).await;
        tracker.on_edit(&TextChange::insert(6, "d")).unwrap();

        let mut guard = tracker.lock().await;
        guard
            .set_state_id("s1".to_string(), Some(&TextChange::new(1, 2, " ")))
            .unwrap();
        let delta = guard.prepare_delta_update().unwrap().unwrap();

        assert_eq!(document.text(), "a b cd");
        assert_eq!(apply_delta("a b c", &delta), "a b cd");
    }

    #[tokio::test]
    async fn test_remote_change_after_local_edit() {
        let (document, tracker) = tracker("ab  c");
        synced(&tracker).await;
        tracker.on_edit(&TextChange::insert(0, "xy")).unwrap();

        let mut guard = tracker.lock().await;
        guard
            .set_state_id("s1".to_string(), Some(&TextChange::new(2, 2, " ")))
            .unwrap();
        let delta = guard.prepare_delta_update().unwrap().unwrap();

        assert_eq!(document.text(), "xyab c");
        assert_eq!(apply_delta("ab c", &delta), "xyab c");
    }

    #[tokio::test]
    async fn test_overlapping_remote_change_invalidates_state() {
        let (document, tracker) = tracker("a  b");
        synced(&tracker).await;
        tracker.on_edit(&TextChange::insert(2, "x")).unwrap();

        let mut guard = tracker.lock().await;
        guard
            .set_state_id("s1".to_string(), Some(&TextChange::new(1, 2, " ")))
            .unwrap();
        drop(guard);

        assert_eq!(document.text(), "a x b");
        assert_eq!(tracker.state_id(), None);
        assert!(tracker.needs_update());
    }
}
