//! Pusher: reads the local sequence feed and streams revisions to a peer
//! (§4.8).

use crate::actor::{ActivityCell, ActivityLevel};
use crate::replicator::dbactor::DbActorHandle;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const CHANGES_BATCH_SIZE: usize = 500;
/// Maximum unacknowledged `rev` messages in flight, per §4.8's "K
/// (implementation choice, typically 10)".
pub const MAX_INFLIGHT_REVS: usize = 10;

#[derive(Clone, Serialize, Deserialize)]
pub struct OutgoingChange {
    pub seq: u64,
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    #[serde(skip)]
    pub body: Vec<u8>,
}

pub struct Pusher {
    db: DbActorHandle,
    last_pushed: AtomicU64,
    activity: ActivityCell,
    inflight: Arc<Semaphore>,
}

impl Pusher {
    pub fn new(db: DbActorHandle, last_pushed: u64) -> Self {
        Self {
            db,
            last_pushed: AtomicU64::new(last_pushed),
            activity: ActivityCell::new(ActivityLevel::Idle),
            inflight: Arc::new(Semaphore::new(MAX_INFLIGHT_REVS)),
        }
    }

    pub fn last_pushed(&self) -> u64 {
        self.last_pushed.load(Ordering::Acquire)
    }

    pub fn activity(&self) -> ActivityLevel {
        self.activity.get()
    }

    /// Reads up to [`CHANGES_BATCH_SIZE`] pending changes since the last
    /// push cursor, for the caller to send as a `changes` message. Each
    /// entry carries the document's actual current revID/deleted/body,
    /// read back through the `DBActor` — a change announcement with no
    /// real revision behind it would leave the peer unable to ever
    /// request the `rev`.
    pub async fn next_batch(&self) -> Vec<OutgoingChange> {
        self.activity.set(ActivityLevel::Busy);
        let changes = self.db.changes_since(self.last_pushed()).await;
        let mut batch = Vec::with_capacity(changes.len().min(CHANGES_BATCH_SIZE));
        for change in changes.into_iter().take(CHANGES_BATCH_SIZE) {
            if let Some(current) = self.db.current_rev(&change.doc_id).await {
                batch.push(OutgoingChange {
                    seq: change.sequence,
                    doc_id: change.doc_id,
                    rev_id: String::from_utf8_lossy(&current.rev_id).into_owned(),
                    deleted: current.deleted,
                    body: current.body,
                });
            }
        }
        if batch.is_empty() {
            self.activity.set(ActivityLevel::Idle);
        }
        batch
    }

    /// Acquires one of the [`MAX_INFLIGHT_REVS`] backpressure slots before
    /// sending a `rev` message; the returned permit must be held until the
    /// peer acknowledges.
    pub async fn acquire_send_slot(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.inflight
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    /// Called once a batch's changes have all been acknowledged (or the
    /// batch was empty), advancing the checkpoint cursor.
    pub fn advance(&self, through_seq: u64) {
        let mut current = self.last_pushed.load(Ordering::Acquire);
        while through_seq > current {
            match self.last_pushed.compare_exchange_weak(
                current,
                through_seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseConfig};
    use tempfile::TempDir;

    fn new_pusher() -> (TempDir, Pusher) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db"), DatabaseConfig::default()).unwrap();
        (dir, Pusher::new(DbActorHandle::spawn(db), 0))
    }

    #[tokio::test]
    async fn empty_feed_yields_empty_batch_and_idle() {
        let (_dir, pusher) = new_pusher();
        let batch = pusher.next_batch().await;
        assert!(batch.is_empty());
        assert_eq!(pusher.activity(), ActivityLevel::Idle);
    }

    #[test]
    fn advance_never_moves_checkpoint_backward() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db"), DatabaseConfig::default()).unwrap();
        let pusher = Pusher::new(DbActorHandle::spawn(db), 10);
        pusher.advance(5);
        assert_eq!(pusher.last_pushed(), 10);
        pusher.advance(20);
        assert_eq!(pusher.last_pushed(), 20);
    }
}
