//! Replicator: owns the socket, Pusher, Puller, and the sole `DBActor`
//! (§4.8).

pub mod checkpoint;
pub mod dbactor;
pub mod puller;
pub mod pusher;

use crate::actor::ActivityLevel;
use crate::blip::{self, Connection, Handler, Message};
use crate::database::Database;
use crate::error::Result;
use checkpoint::Checkpoint;
use dbactor::DbActorHandle;
use puller::{Puller, RevBody};
use pusher::Pusher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Replication direction/mode for one side (push or pull), per §6 `Config`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplicatorMode {
    #[default]
    Disabled,
    Passive,
    OneShot,
    Continuous,
}

#[derive(Clone, Debug, Default)]
pub struct ReplicatorOptions {
    pub push: ReplicatorMode,
    pub pull: ReplicatorMode,
}

/// Why a replication socket closed, per §5's close-semantics table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    WebSocketClose { code: u16, message: String },
    Posix(String),
    Dns(String),
}

impl CloseReason {
    /// `Normal` (1000) and `GoingAway` (1001) are clean closes.
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::WebSocketClose { code: 1000 | 1001, .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicatorState {
    Connecting,
    Idle,
    Busy,
    Stopping,
    Stopped(Option<CloseReason>),
}

/// Binds a socket, a [`Pusher`], a [`Puller`], and the sole [`DbActorHandle`]
/// that touches the database while replication runs.
pub struct Replicator {
    remote_url: String,
    db: DbActorHandle,
    connection: Connection,
    pusher: Option<Arc<Pusher>>,
    puller: Option<Arc<Puller>>,
    options: ReplicatorOptions,
}

impl Replicator {
    /// Opens the socket, exchanges checkpoints, and starts whichever peers
    /// `options` enables.
    ///
    /// The Puller's `handle_changes`/`handle_rev` are registered as the
    /// `changes`/`rev` BLIP profile handlers before the socket connects, so
    /// an inbound request is never missed; a `subChanges` request is sent
    /// right after connecting to start the remote's change feed, and a
    /// background task drives the Pusher's own `changes`/`rev` calls for as
    /// long as the replicator lives.
    pub async fn connect(remote_url: &str, db: Database, options: ReplicatorOptions) -> Result<Self> {
        let checkpoint = checkpoint::load(&db, remote_url)?;
        let db = DbActorHandle::spawn(db);

        let puller = (options.pull != ReplicatorMode::Disabled).then(|| Arc::new(Puller::new(db.clone())));
        let pusher = (options.push != ReplicatorMode::Disabled)
            .then(|| Arc::new(Pusher::new(db.clone(), checkpoint.last_pushed)));

        let mut handlers: HashMap<String, Handler> = HashMap::new();
        if let Some(puller) = &puller {
            handlers.insert("changes".to_string(), changes_handler(puller.clone()));
            handlers.insert(
                "rev".to_string(),
                rev_handler(puller.clone(), db.clone(), remote_url.to_string(), pusher.clone()),
            );
        }

        let connection = Connection::connect(remote_url, handlers).await?;

        if let Some(puller) = &puller {
            puller.start(checkpoint.last_pulled);
            connection.send(Message {
                properties: vec![
                    ("Profile".to_string(), "subChanges".to_string()),
                    ("since".to_string(), checkpoint.last_pulled.to_string()),
                ],
                ..Default::default()
            })?;
        }

        if let Some(pusher) = &pusher {
            tokio::spawn(run_push_loop(
                pusher.clone(),
                connection.clone(),
                db.clone(),
                remote_url.to_string(),
                puller.clone(),
            ));
        }

        tracing::info!(remote = %remote_url, ?options, "replicator.connect");

        Ok(Self {
            remote_url: remote_url.to_string(),
            db,
            connection,
            pusher,
            puller,
            options,
        })
    }

    pub fn options(&self) -> &ReplicatorOptions {
        &self.options
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ReplicatorState {
        let levels = [
            self.pusher.as_ref().map(|p| p.activity()),
            self.puller.as_ref().map(|p| p.activity()),
        ];
        if levels.iter().flatten().any(|l| *l == ActivityLevel::Busy) {
            ReplicatorState::Busy
        } else if levels.iter().flatten().any(|l| *l == ActivityLevel::Connecting) {
            ReplicatorState::Connecting
        } else {
            ReplicatorState::Idle
        }
    }

    /// Persists the current cursors as the checkpoint for this remote,
    /// through the `DBActor` so the write is serialized with other
    /// database access.
    pub async fn checkpoint(&self) -> Result<()> {
        persist_checkpoint(&self.db, &self.remote_url, self.pusher.as_deref(), self.puller.as_deref()).await
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }
}

/// Builds the `changes` profile handler: filters an inbound batch against
/// locally-held revisions and returns the wanted-bitmap as the response body.
fn changes_handler(puller: Arc<Puller>) -> Handler {
    blip::handler_fn(move |msg: Message| {
        let puller = puller.clone();
        async move {
            let wanted = puller.handle_changes(&msg).await?;
            Ok(Message {
                body: serde_json::to_vec(&wanted)
                    .map_err(|e| crate::error::Error::CorruptIndexData(e.to_string()))?,
                ..Default::default()
            })
        }
    })
}

/// Builds the `rev` profile handler: inserts the revision, persists the
/// advanced checkpoint, and replies with an empty success response (an
/// error response carries `Error-Message`, set automatically by the BLIP
/// driver when the handler returns `Err`).
fn rev_handler(puller: Arc<Puller>, db: DbActorHandle, remote_url: String, pusher: Option<Arc<Pusher>>) -> Handler {
    blip::handler_fn(move |msg: Message| {
        let puller = puller.clone();
        let db = db.clone();
        let remote_url = remote_url.clone();
        let pusher = pusher.clone();
        async move {
            let remote_seq = msg
                .properties
                .iter()
                .find(|(k, _)| k == "sequence")
                .and_then(|(_, v)| v.parse::<u64>().ok())
                .unwrap_or(0);
            puller.handle_rev(&msg, remote_seq).await?;
            persist_checkpoint(&db, &remote_url, pusher.as_deref(), Some(puller.as_ref())).await;
            Ok(Message::default())
        }
    })
}

/// Drives the Pusher for as long as the connection lives: reads a batch of
/// local changes, announces it via a `changes` request, sends a `rev` for
/// each entry the peer wants, and advances/persists the checkpoint.
async fn run_push_loop(
    pusher: Arc<Pusher>,
    connection: Connection,
    db: DbActorHandle,
    remote_url: String,
    puller: Option<Arc<Puller>>,
) {
    loop {
        let batch = pusher.next_batch().await;
        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        let body = match serde_json::to_vec(&batch) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "replicator.push.encode_failed");
                continue;
            }
        };
        let changes_msg = Message {
            properties: vec![("Profile".to_string(), "changes".to_string())],
            body,
            ..Default::default()
        };
        let response = match connection.send_request(changes_msg).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "replicator.push.changes_failed");
                break;
            }
        };
        let wanted: Vec<bool> = serde_json::from_slice(&response.body).unwrap_or_default();

        let mut max_seq = pusher.last_pushed();
        for (change, &want) in batch.iter().zip(wanted.iter().chain(std::iter::repeat(&false))) {
            max_seq = max_seq.max(change.seq);
            if !want {
                continue;
            }
            let permit = pusher.acquire_send_slot().await;
            let rev_body = RevBody {
                doc_id: change.doc_id.clone(),
                rev_id: change.rev_id.clone(),
                history: Vec::new(),
                deleted: change.deleted,
                body: change.body.clone(),
            };
            let rev_msg = Message {
                properties: vec![
                    ("Profile".to_string(), "rev".to_string()),
                    ("sequence".to_string(), change.seq.to_string()),
                ],
                body: serde_json::to_vec(&rev_body).unwrap_or_default(),
                ..Default::default()
            };
            if let Err(e) = connection.send_request(rev_msg).await {
                tracing::warn!(error = %e, doc_id = %change.doc_id, "replicator.push.rev_failed");
            }
            drop(permit);
        }

        pusher.advance(max_seq);
        persist_checkpoint(&db, &remote_url, Some(pusher.as_ref()), puller.as_deref()).await;
    }
}

async fn persist_checkpoint(db: &DbActorHandle, remote_url: &str, pusher: Option<&Pusher>, puller: Option<&Puller>) {
    let checkpoint = Checkpoint {
        last_pushed: pusher.map(|p| p.last_pushed()).unwrap_or(0),
        last_pulled: puller.map(|p| p.last_sequence()).unwrap_or(0),
    };
    if let Err(e) = db.save_checkpoint(remote_url, checkpoint).await {
        tracing::warn!(error = %e, remote = %remote_url, "replicator.checkpoint_failed");
    }
}

/// Reconstructs the persisted `(lastPushed, lastPulled)` pair for a remote,
/// used by callers (tests, CLI tooling) that want to inspect a checkpoint
/// without opening a live connection.
pub fn load_checkpoint(db: &Database, remote_url: &str) -> Result<Checkpoint> {
    checkpoint::load(db, remote_url)
}
