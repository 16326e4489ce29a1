//! Persisted replication cursor (§4.8): `(lastPushed, lastPulled)` for one
//! remote peer, stored as a raw document keyed by a hash of the remote URL.

use crate::database::Database;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

const CHECKPOINT_STORE: &str = "checkpoints";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_pushed: u64,
    pub last_pulled: u64,
}

pub fn checkpoint_key(remote_url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(remote_url.as_bytes());
    format!("checkpoint/{:x}", hasher.finalize())
}

pub fn load(db: &Database, remote_url: &str) -> Result<Checkpoint> {
    let key = checkpoint_key(remote_url);
    match db.get_raw_document(CHECKPOINT_STORE, key.as_bytes())? {
        Some(record) if !record.body.is_empty() => {
            let checkpoint = serde_json::from_slice(&record.body).unwrap_or_default();
            Ok(checkpoint)
        }
        _ => Ok(Checkpoint::default()),
    }
}

/// Written transactionally after advancing either cursor, per §4.8.
pub fn save(db: &Database, remote_url: &str, checkpoint: Checkpoint) -> Result<()> {
    let key = checkpoint_key(remote_url);
    let body = serde_json::to_vec(&checkpoint).expect("Checkpoint serializes infallibly");
    db.begin_transaction()?;
    let result = db.put_raw_document(CHECKPOINT_STORE, key.as_bytes(), &body);
    match result {
        Ok(()) => db.end_transaction(true),
        Err(e) => {
            let _ = db.end_transaction(false);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_raw_document() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db"), DatabaseConfig::default()).unwrap();

        let loaded = load(&db, "wss://peer/db/_blipsync").unwrap();
        assert_eq!(loaded, Checkpoint::default());

        save(
            &db,
            "wss://peer/db/_blipsync",
            Checkpoint {
                last_pushed: 7,
                last_pulled: 3,
            },
        )
        .unwrap();

        let loaded = load(&db, "wss://peer/db/_blipsync").unwrap();
        assert_eq!(loaded.last_pushed, 7);
        assert_eq!(loaded.last_pulled, 3);
    }
}
