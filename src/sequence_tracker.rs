//! In-memory feed of `(sequence, docID)` tuples for replicator/observer
//! listeners (§4.5).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub sequence: u64,
    pub doc_id: String,
}

struct Inner {
    history: VecDeque<Change>,
    /// One cursor per live listener — the smallest of these bounds how much
    /// of `history` can be evicted.
    cursors: Vec<Arc<AtomicU64>>,
}

/// Tracks every `saved(doc)` notification since the tracker was created and
/// lets listeners replay from a "since" cursor. History entries older than
/// every listener's cursor are evicted eagerly.
pub struct SequenceTracker {
    inner: Mutex<Inner>,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::new(),
                cursors: Vec::new(),
            }),
        }
    }

    /// Called by the database after a commit appends a record.
    pub fn saved(&self, sequence: u64, doc_id: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.history.push_back(Change {
            sequence,
            doc_id: doc_id.into(),
        });
        Self::evict(&mut inner);
    }

    /// Registers a listener starting after `since`, returning a [`Listener`]
    /// handle used to poll and to cancel.
    pub fn add_listener(self: &Arc<Self>, since: u64) -> Listener {
        let cursor = Arc::new(AtomicU64::new(since));
        self.inner.lock().cursors.push(cursor.clone());
        Listener {
            tracker: self.clone(),
            cursor,
        }
    }

    /// Changes strictly after `since`, oldest first.
    pub fn changes_since(&self, since: u64) -> Vec<Change> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|c| c.sequence > since)
            .cloned()
            .collect()
    }

    fn evict(inner: &mut Inner) {
        let floor = inner.cursors.iter().map(|c| c.load(Ordering::Acquire)).min();
        let Some(floor) = floor else { return };
        while let Some(front) = inner.history.front() {
            if front.sequence <= floor {
                inner.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn remove_cursor(&self, cursor: &Arc<AtomicU64>) {
        let mut inner = self.inner.lock();
        inner.cursors.retain(|c| !Arc::ptr_eq(c, cursor));
        Self::evict(&mut inner);
    }
}

/// A registered listener's cursor. Dropping it cancels the registration.
pub struct Listener {
    tracker: Arc<SequenceTracker>,
    cursor: Arc<AtomicU64>,
}

impl Listener {
    pub fn since(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Replays and advances past every change currently pending for this
    /// listener.
    pub fn poll(&self) -> Vec<Change> {
        let since = self.since();
        let changes = self.tracker.changes_since(since);
        if let Some(last) = changes.last() {
            self.cursor.store(last.sequence, Ordering::Release);
            SequenceTracker::evict(&mut self.tracker.inner.lock());
        }
        changes
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.tracker.remove_cursor(&self.cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_replays_only_new_changes() {
        let tracker = Arc::new(SequenceTracker::new());
        tracker.saved(1, "a");
        tracker.saved(2, "b");

        let listener = tracker.add_listener(0);
        let changes = listener.poll();
        assert_eq!(changes.len(), 2);
        assert_eq!(listener.since(), 2);

        tracker.saved(3, "c");
        let more = listener.poll();
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].doc_id, "c");
    }

    #[test]
    fn history_evicted_once_all_listeners_pass_it() {
        let tracker = Arc::new(SequenceTracker::new());
        let listener = tracker.add_listener(0);
        tracker.saved(1, "a");
        tracker.saved(2, "b");
        assert_eq!(tracker.inner.lock().history.len(), 2);

        listener.poll();
        assert_eq!(tracker.inner.lock().history.len(), 0);
    }

    #[test]
    fn dropped_listener_unblocks_eviction() {
        let tracker = Arc::new(SequenceTracker::new());
        let listener = tracker.add_listener(0);
        tracker.saved(1, "a");
        drop(listener);
        assert_eq!(tracker.inner.lock().history.len(), 0);
    }
}
