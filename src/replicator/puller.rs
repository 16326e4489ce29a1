//! Puller: pulls remote revisions into the local database (§4.8).
//!
//! Grounded directly in the original `Puller` — `start(sinceSequence)`,
//! `handleChanges`, `handleRev`, `markComplete`, a `kChangesBatchSize` of
//! 500, and the `requestedSequences`/`caughtUp` bookkeeping that drives
//! `lastSequence` and the activity level.

use crate::actor::{ActivityCell, ActivityLevel};
use crate::blip::Message;
use crate::error::{Error, Result};
use crate::replicator::dbactor::DbActorHandle;
use crate::rev_tree::{Rev, RevFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

pub const CHANGES_BATCH_SIZE: usize = 500;

#[derive(Serialize, Deserialize)]
struct ChangeEntry {
    #[serde(rename = "seq")]
    remote_seq: u64,
    doc_id: String,
    rev_id: String,
    #[serde(default)]
    deleted: bool,
}

/// Wire shape of a `rev` message body. `pub(crate)` so the Pusher side can
/// build the same shape when it sends revisions out.
#[derive(Serialize, Deserialize)]
pub(crate) struct RevBody {
    pub doc_id: String,
    pub rev_id: String,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
    pub body: Vec<u8>,
}

pub struct Puller {
    db: DbActorHandle,
    last_sequence: AtomicU64,
    caught_up: AtomicBool,
    requested: Mutex<BTreeSet<u64>>,
    activity: ActivityCell,
}

impl Puller {
    pub fn new(db: DbActorHandle) -> Self {
        Self {
            db,
            last_sequence: AtomicU64::new(0),
            caught_up: AtomicBool::new(false),
            requested: Mutex::new(BTreeSet::new()),
            activity: ActivityCell::new(ActivityLevel::Idle),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn activity(&self) -> ActivityLevel {
        self.activity.get()
    }

    /// `start(sinceSequence)`: the caller is expected to have already sent
    /// the `subChanges` request carrying `since_sequence`; this records the
    /// cursor the puller resumes from.
    pub fn start(&self, since_sequence: u64) {
        self.last_sequence.store(since_sequence, Ordering::Release);
        self.activity.set(ActivityLevel::Connecting);
    }

    /// Handles an inbound `changes` message: up to [`CHANGES_BATCH_SIZE`]
    /// entries. Returns the bitmap of entries wanted (filtered against
    /// local revs via the `DBActor`), which the caller sends back as the
    /// response body.
    pub async fn handle_changes(&self, msg: &Message) -> Result<Vec<bool>> {
        let entries: Vec<ChangeEntry> = serde_json::from_slice(&msg.body)
            .map_err(|e| Error::CorruptIndexData(format!("malformed changes body: {e}")))?;

        if entries.is_empty() {
            self.caught_up.store(true, Ordering::Release);
            self.update_activity();
            return Ok(Vec::new());
        }

        let mut wanted = Vec::with_capacity(entries.len());
        let mut requested = self.requested.lock().await;
        for entry in &entries {
            let have = self.db.has_rev(&entry.doc_id, entry.rev_id.as_bytes()).await;
            wanted.push(!have);
            if !have {
                requested.insert(entry.remote_seq);
            }
        }
        drop(requested);
        self.activity.set(ActivityLevel::Busy);
        Ok(wanted)
    }

    /// Handles an inbound `rev` message: inserts the revision into the
    /// local tree via the `DBActor`, then advances the checkpoint cursor.
    pub async fn handle_rev(&self, msg: &Message, remote_seq: u64) -> Result<()> {
        let rev_body: RevBody = serde_json::from_slice(&msg.body)
            .map_err(|e| Error::CorruptIndexData(format!("malformed rev body: {e}")))?;

        let mut flags = RevFlags::LEAF;
        if rev_body.deleted {
            flags.insert(RevFlags::DELETED);
        }
        let rev = Rev {
            rev_id: rev_body.rev_id.into_bytes(),
            parent_index: crate::rev_tree::NONE,
            sequence: 0,
            flags,
            body: rev_body.body,
        };
        let parent_rev_id = rev_body.history.first().map(|s| s.clone().into_bytes());

        let result = self.db.insert_rev(&rev_body.doc_id, parent_rev_id, rev).await;
        self.mark_complete(remote_seq).await;
        result.map(|_| ())
    }

    /// Marks a remote sequence complete (inserted, or permanently failed),
    /// then advances `lastSequence` to the smallest still-outstanding minus
    /// one — a gap in `requestedSequences` stalls the checkpoint.
    pub async fn mark_complete(&self, remote_seq: u64) {
        let mut requested = self.requested.lock().await;
        requested.remove(&remote_seq);
        let new_last = match requested.iter().next() {
            Some(&smallest) => smallest.saturating_sub(1),
            None => remote_seq,
        };
        if new_last > self.last_sequence.load(Ordering::Acquire) {
            self.last_sequence.store(new_last, Ordering::Release);
        }
        let empty = requested.is_empty();
        drop(requested);
        if empty {
            self.update_activity();
        }
    }

    fn update_activity(&self) {
        if self.caught_up.load(Ordering::Acquire) {
            self.activity.set(ActivityLevel::Idle);
        }
    }
}
