//! The sole actor that touches the `Database` while replication is active
//! (§4.8 expansion): Puller and Pusher never hold a `Database` reference
//! directly, only a [`DbActorHandle`].

use crate::actor::{ActivityCell, ActivityLevel, Mailbox, Reply};
use crate::database::Database;
use crate::error::Result;
use crate::replicator::checkpoint::{self, Checkpoint};
use crate::rev_tree::{Rev, RevTree};
use crate::sequence_tracker::Change;
use tokio::sync::mpsc;

/// The current revision of a document, as needed to announce or send it
/// during a push (§4.8).
pub struct CurrentRev {
    pub rev_id: Vec<u8>,
    pub deleted: bool,
    pub body: Vec<u8>,
}

enum DbMsg {
    HasRev {
        doc_id: String,
        rev_id: Vec<u8>,
        reply: Reply<bool>,
    },
    InsertRev {
        doc_id: String,
        parent_rev_id: Option<Vec<u8>>,
        rev: Rev,
        reply: Reply<Result<u64>>,
    },
    CurrentRev {
        doc_id: String,
        reply: Reply<Option<CurrentRev>>,
    },
    ChangesSince {
        since: u64,
        reply: Reply<Vec<Change>>,
    },
    LastSequence {
        reply: Reply<Result<u64>>,
    },
    SaveCheckpoint {
        remote_url: String,
        checkpoint: Checkpoint,
        reply: Reply<Result<()>>,
    },
}

#[derive(Clone)]
pub struct DbActorHandle {
    tx: mpsc::UnboundedSender<DbMsg>,
    activity: ActivityCell,
}

impl DbActorHandle {
    pub fn spawn(db: Database) -> Self {
        let Mailbox { tx, rx } = Mailbox::channel();
        let activity = ActivityCell::new(ActivityLevel::Idle);
        let driver = DbActorDriver { db, rx };
        tokio::spawn(driver.run());
        Self { tx, activity }
    }

    pub fn activity(&self) -> ActivityLevel {
        self.activity.get()
    }

    pub async fn has_rev(&self, doc_id: &str, rev_id: &[u8]) -> bool {
        let (reply, rx) = Reply::pair();
        if self
            .tx
            .send(DbMsg::HasRev {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_vec(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Inserts an incoming revision as a child of `parent_rev_id` (or a new
    /// root if `None`), returning the sequence it was assigned.
    pub async fn insert_rev(&self, doc_id: &str, parent_rev_id: Option<Vec<u8>>, rev: Rev) -> Result<u64> {
        let (reply, rx) = Reply::pair();
        self.tx
            .send(DbMsg::InsertRev {
                doc_id: doc_id.to_string(),
                parent_rev_id,
                rev,
                reply,
            })
            .map_err(|_| crate::error::Error::Network("db actor stopped".into()))?;
        rx.await.map_err(|_| crate::error::Error::Network("db actor stopped".into()))?
    }

    /// The current revision of `doc_id`, for the Pusher to announce (and
    /// then send) — `None` if the document doesn't exist.
    pub async fn current_rev(&self, doc_id: &str) -> Option<CurrentRev> {
        let (reply, rx) = Reply::pair();
        if self
            .tx
            .send(DbMsg::CurrentRev {
                doc_id: doc_id.to_string(),
                reply,
            })
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn changes_since(&self, since: u64) -> Vec<Change> {
        let (reply, rx) = Reply::pair();
        if self.tx.send(DbMsg::ChangesSince { since, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn last_sequence(&self) -> Result<u64> {
        let (reply, rx) = Reply::pair();
        self.tx
            .send(DbMsg::LastSequence { reply })
            .map_err(|_| crate::error::Error::Network("db actor stopped".into()))?;
        rx.await.map_err(|_| crate::error::Error::Network("db actor stopped".into()))?
    }

    /// Persists `checkpoint` for `remote_url`, serialized with other
    /// database access through this actor.
    pub async fn save_checkpoint(&self, remote_url: &str, checkpoint: Checkpoint) -> Result<()> {
        let (reply, rx) = Reply::pair();
        self.tx
            .send(DbMsg::SaveCheckpoint {
                remote_url: remote_url.to_string(),
                checkpoint,
                reply,
            })
            .map_err(|_| crate::error::Error::Network("db actor stopped".into()))?;
        rx.await.map_err(|_| crate::error::Error::Network("db actor stopped".into()))?
    }
}

struct DbActorDriver {
    db: Database,
    rx: mpsc::UnboundedReceiver<DbMsg>,
}

impl DbActorDriver {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle_one(msg);
        }
    }

    fn handle_one(&mut self, msg: DbMsg) {
        match msg {
            DbMsg::HasRev { doc_id, rev_id, reply } => {
                let found = self
                    .db
                    .get_document(&doc_id)
                    .map(|doc| doc.rev_tree.find_by_rev_id(&rev_id).is_some())
                    .unwrap_or(false);
                reply.send(found);
            }
            DbMsg::InsertRev {
                doc_id,
                parent_rev_id,
                rev,
                reply,
            } => {
                reply.send(self.insert_rev(&doc_id, parent_rev_id, rev));
            }
            DbMsg::CurrentRev { doc_id, reply } => {
                reply.send(self.current_rev(&doc_id));
            }
            DbMsg::ChangesSince { since, reply } => {
                reply.send(self.db.sequence_tracker().changes_since(since));
            }
            DbMsg::LastSequence { reply } => {
                reply.send(self.db.last_sequence());
            }
            DbMsg::SaveCheckpoint {
                remote_url,
                checkpoint,
                reply,
            } => {
                reply.send(checkpoint::save(&self.db, &remote_url, checkpoint));
            }
        }
    }

    fn current_rev(&mut self, doc_id: &str) -> Option<CurrentRev> {
        let doc = self.db.get_document(doc_id).ok()?;
        let index = doc.current_rev_index?;
        let rev = doc.rev_tree.get(index)?;
        Some(CurrentRev {
            rev_id: rev.rev_id.clone(),
            deleted: rev.is_deleted(),
            body: rev.body.clone(),
        })
    }

    fn insert_rev(&mut self, doc_id: &str, parent_rev_id: Option<Vec<u8>>, rev: Rev) -> Result<u64> {
        // A rev already present in the tree (redelivery, or a rev both
        // peers independently pushed to each other) is a true no-op: no
        // transaction, no new sequence, no re-announce to the pusher.
        {
            let doc = self.db.get_document(doc_id)?;
            if let Some(index) = doc.rev_tree.find_by_rev_id(&rev.rev_id) {
                let existing = doc.rev_tree.get(index).expect("index came from find_by_rev_id");
                return Ok(existing.sequence);
            }
        }
        self.db.begin_transaction()?;
        let result = (|| {
            let mut doc = self.db.get_document(doc_id)?;
            let parent = match &parent_rev_id {
                Some(id) => doc
                    .rev_tree
                    .find_by_rev_id(id)
                    .map(|i| i as u16)
                    .unwrap_or(crate::rev_tree::NONE),
                None => crate::rev_tree::NONE,
            };
            doc.rev_tree.insert(parent, rev)?;
            self.db.put_document(doc_id, &RevTree::new(doc.rev_tree.revs().to_vec()))
        })();
        match result {
            Ok(seq) => {
                self.db.end_transaction(true)?;
                Ok(seq)
            }
            Err(e) => {
                let _ = self.db.end_transaction(false);
                Err(e)
            }
        }
    }
}
