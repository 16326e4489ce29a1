//! Transactional key/value record store over SQLite (§4.1).

pub mod sqlite_store;

pub use sqlite_store::{KeyStoreCapabilities, RecordStore, SqliteHandle};

use serde::{Deserialize, Serialize};

/// A single row of a key-store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
    pub sequence: u64,
    pub deleted: bool,
}

impl Record {
    pub fn exists(&self) -> bool {
        self.sequence != 0 || !self.key.is_empty()
    }
}

/// Which columns a `get` fetches — `MetaOnly` skips the body column to save I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ContentOptions {
    #[default]
    Default,
    MetaOnly,
}

/// Inclusive/exclusive bound for a range enumeration.
#[derive(Clone, Debug, Default)]
pub struct KeyRange {
    pub min: Option<Vec<u8>>,
    pub min_inclusive: bool,
    pub max: Option<Vec<u8>>,
    pub max_inclusive: bool,
    pub descending: bool,
    pub include_deleted: bool,
    pub limit: Option<u64>,
    pub skip: u64,
}

impl KeyRange {
    pub fn new() -> Self {
        Self {
            min_inclusive: true,
            max_inclusive: true,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SequenceRange {
    pub since: u64,
    pub limit: Option<u64>,
}
