//! Database facade (§4.4): binds the record store, the document factory,
//! the blob store and the sequence tracker behind one transaction-aware
//! handle.

use crate::blob_store::{BlobStore, BlobStoreOptions, EncryptionAlgorithm};
use crate::error::{Error, Result};
use crate::record_store::{ContentOptions, KeyStoreCapabilities, Record, RecordStore, SqliteHandle};
use crate::rev_tree::{RevFlags, RevTree};
use crate::sequence_tracker::SequenceTracker;
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which document-history model a database was opened with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Versioning {
    #[default]
    RevTrees,
    VersionVectors,
}

/// Construction-time configuration (§6 `Config`), loadable directly from
/// JSON/TOML via `serde` — no hidden global state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub writeable: bool,
    pub create: bool,
    #[serde(default)]
    pub encryption_algorithm: EncryptionAlgorithm,
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<Vec<u8>>,
    #[serde(default)]
    pub versioning: Versioning,
    #[serde(default = "default_max_rev_tree_depth")]
    pub max_rev_tree_depth: u32,
}

fn default_max_rev_tree_depth() -> u32 {
    20
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            writeable: true,
            create: true,
            encryption_algorithm: EncryptionAlgorithm::None,
            encryption_key: None,
            versioning: Versioning::RevTrees,
            max_rev_tree_depth: default_max_rev_tree_depth(),
        }
    }
}

/// A document as handed out by a [`DocumentFactory`]: its current revision
/// tree plus the summary flags derived from it.
#[derive(Clone, Debug)]
pub struct Document {
    pub doc_id: String,
    pub exists: bool,
    pub deleted: bool,
    pub conflicted: bool,
    pub has_attachments: bool,
    pub rev_tree: RevTree,
    pub current_rev_index: Option<usize>,
}

/// The small capability interface that stands in for what would otherwise
/// be a `DocumentFactory` base class: construct a [`Document`] from a
/// record's raw meta/body, the versioning scheme's only real seam.
pub trait DocumentFactory: Send + Sync {
    fn new_document(&self, doc_id: &str, rev_tree_blob: Option<&[u8]>, cur_seq: u64) -> Result<Document>;
}

/// The fully implemented revision-tree factory.
pub struct TreeDocumentFactory {
    max_rev_tree_depth: u32,
}

impl TreeDocumentFactory {
    pub fn new(max_rev_tree_depth: u32) -> Self {
        Self { max_rev_tree_depth }
    }
}

impl DocumentFactory for TreeDocumentFactory {
    fn new_document(&self, doc_id: &str, rev_tree_blob: Option<&[u8]>, cur_seq: u64) -> Result<Document> {
        let mut rev_tree = match rev_tree_blob {
            Some(blob) if !blob.is_empty() => RevTree::from_blob(blob, cur_seq)?,
            _ => RevTree::new(Vec::new()),
        };
        if self.max_rev_tree_depth > 0 {
            rev_tree.prune(self.max_rev_tree_depth);
        }

        let current_rev_index = rev_tree.current_rev_index();
        let (deleted, has_attachments) = match current_rev_index {
            Some(i) => {
                let rev = rev_tree.get(i).expect("current_rev_index is in range");
                (rev.is_deleted(), rev.flags.contains(RevFlags::HAS_ATTACHMENTS))
            }
            None => (false, false),
        };

        Ok(Document {
            doc_id: doc_id.to_string(),
            exists: current_rev_index.is_some(),
            deleted,
            conflicted: rev_tree.is_conflicted(),
            has_attachments,
            rev_tree,
            current_rev_index,
        })
    }
}

/// Named, not silently absent: version-vector documents are scoped out of
/// this crate's §1 "columnar body encoder is opaque" boundary, but the
/// `Versioning::VersionVectors` config value is real and routes here
/// instead of being unreachable.
pub struct VectorDocumentFactory;

impl DocumentFactory for VectorDocumentFactory {
    fn new_document(&self, _doc_id: &str, _rev_tree_blob: Option<&[u8]>, _cur_seq: u64) -> Result<Document> {
        Err(Error::Unimplemented("version-vector document factory"))
    }
}

fn make_document_factory(versioning: Versioning, max_rev_tree_depth: u32) -> Box<dyn DocumentFactory> {
    match versioning {
        Versioning::RevTrees => Box::new(TreeDocumentFactory::new(max_rev_tree_depth)),
        Versioning::VersionVectors => Box::new(VectorDocumentFactory),
    }
}

const DEFAULT_STORE: &str = "default";
const UUID_STORE: &str = "uuids";
const RAW_DOCS_STORE_PREFIX: &str = "raw_";

struct TxnState {
    depth: u32,
}

/// The open-database handle. Not `Clone`; shared ownership across actors
/// goes through `DBActor` (§4.8 expansion), never through cloning this type
/// directly.
pub struct Database {
    path: PathBuf,
    config: DatabaseConfig,
    handle: Arc<SqliteHandle>,
    default_store: RecordStore,
    blob_store: BlobStore,
    sequence_tracker: Arc<SequenceTracker>,
    document_factory: Box<dyn DocumentFactory>,
    txn: ReentrantMutex<RefCell<TxnState>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if config.create {
            std::fs::create_dir_all(&path)?;
        } else if !path.exists() {
            return Err(Error::CantOpenFile(path));
        }

        let handle = SqliteHandle::open(path.join("db.sqlite3"), config.create, config.writeable)?;
        let default_store = handle.key_store(DEFAULT_STORE, KeyStoreCapabilities::default_store())?;

        let blob_options = BlobStoreOptions {
            create: config.create,
            writeable: config.writeable,
            encryption_algorithm: config.encryption_algorithm,
            encryption_key: config.encryption_key.clone(),
        };
        let blob_store = BlobStore::open(path.join("Attachments"), blob_options)?;

        let document_factory = make_document_factory(config.versioning, config.max_rev_tree_depth);

        tracing::info!(path = %path.display(), "database.open");

        Ok(Self {
            path,
            document_factory,
            handle,
            default_store,
            blob_store,
            sequence_tracker: Arc::new(SequenceTracker::new()),
            txn: ReentrantMutex::new(RefCell::new(TxnState { depth: 0 })),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn close(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        tracing::info!(path = %self.path.display(), "database.close");
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.blob_store.delete_store()?;
        std::fs::remove_dir_all(&self.path)?;
        Ok(())
    }

    pub fn compact(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.handle.compact()
    }

    /// Changes the database's encryption key in place, per §4.4's
    /// `rekey(key)`. Re-encrypting an existing store to a real algorithm
    /// isn't implemented — see `BlobWriteStream`'s encryption seam — so
    /// this only actually supports rekeying to [`EncryptionAlgorithm::None`]
    /// and reports [`Error::Unimplemented`] for anything else, rather than
    /// accepting a key it can never apply.
    pub fn rekey(&mut self, algorithm: EncryptionAlgorithm, key: Option<Vec<u8>>) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.blob_store.rekey(algorithm, key.clone())?;
        self.config.encryption_algorithm = algorithm;
        self.config.encryption_key = key;
        tracing::info!(path = %self.path.display(), "database.rekey");
        Ok(())
    }

    // -- transaction discipline (§4.4, §5) ---------------------------------

    /// Acquires the reentrant transaction lock for the nesting count; only
    /// the outermost call issues `BEGIN`.
    pub fn begin_transaction(&self) -> Result<()> {
        let guard = self.txn.lock();
        let mut state = guard.borrow_mut();
        if state.depth == 0 {
            self.handle.begin_transaction()?;
        }
        state.depth += 1;
        Ok(())
    }

    /// Only the outermost call issues `COMMIT`/`ROLLBACK`.
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        let guard = self.txn.lock();
        let mut state = guard.borrow_mut();
        if state.depth == 0 {
            return Err(Error::Unexpected("endTransaction with no active transaction".into()));
        }
        state.depth -= 1;
        if state.depth == 0 {
            if commit {
                self.handle.commit()?;
            } else {
                self.handle.rollback()?;
            }
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.lock().borrow().depth > 0
    }

    // -- key-stores ---------------------------------------------------------

    pub fn default_key_store(&self) -> &RecordStore {
        &self.default_store
    }

    pub fn get_key_store(&self, name: &str) -> Result<RecordStore> {
        self.handle.key_store(name, KeyStoreCapabilities::default_store())
    }

    pub fn count_documents(&self) -> Result<u64> {
        self.default_store.record_count()
    }

    pub fn last_sequence(&self) -> Result<u64> {
        self.default_store.last_sequence()
    }

    pub fn sequence_tracker(&self) -> &Arc<SequenceTracker> {
        &self.sequence_tracker
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    pub fn document_factory(&self) -> &dyn DocumentFactory {
        self.document_factory.as_ref()
    }

    /// Save a document's rev-tree blob under `doc_id`, assigning the next
    /// sequence and notifying the sequence tracker. Must run inside a
    /// transaction.
    pub fn put_document(&self, doc_id: &str, rev_tree: &RevTree) -> Result<u64> {
        if !self.in_transaction() {
            return Err(Error::Unexpected("putDocument called outside a transaction".into()));
        }
        let blob = rev_tree.to_blob()?;
        let (sequence, _) = self.default_store.set(doc_id.as_bytes(), &[], &blob)?;
        self.sequence_tracker.saved(sequence, doc_id);
        Ok(sequence)
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Document> {
        let record = self.default_store.get(doc_id.as_bytes(), ContentOptions::Default)?;
        match record {
            Some(rec) => self.document_factory.new_document(doc_id, Some(&rec.body), rec.sequence),
            None => self.document_factory.new_document(doc_id, None, 0),
        }
    }

    /// Hard-deletes a document's row outright, bypassing any soft-delete
    /// policy — distinct from recording a deletion revision.
    pub fn purge_document(&self, doc_id: &str) -> Result<bool> {
        if !self.in_transaction() {
            return Err(Error::Unexpected("purgeDocument called outside a transaction".into()));
        }
        self.default_store.purge(doc_id.as_bytes())
    }

    // -- raw documents (§4.4) ------------------------------------------------

    pub fn get_raw_document(&self, store_name: &str, key: &[u8]) -> Result<Option<Record>> {
        let store = self.raw_store(store_name)?;
        store.get(key, ContentOptions::Default)
    }

    pub fn put_raw_document(&self, store_name: &str, key: &[u8], body: &[u8]) -> Result<()> {
        let store = self.raw_store(store_name)?;
        store.set(key, &[], body)?;
        Ok(())
    }

    fn raw_store(&self, store_name: &str) -> Result<RecordStore> {
        self.handle.key_store(
            &format!("{RAW_DOCS_STORE_PREFIX}{store_name}"),
            KeyStoreCapabilities {
                sequences: false,
                soft_deletes: false,
                get_by_offset: false,
            },
        )
    }

    // -- UUIDs (§4.4) ---------------------------------------------------------

    /// The public or private 32-byte database identifier, generated and
    /// persisted on first read.
    pub fn get_uuid(&self, public: bool) -> Result<[u8; 32]> {
        let key: &[u8] = if public { b"public" } else { b"private" };
        let store = self.raw_store(UUID_STORE)?;
        if let Some(rec) = store.get(key, ContentOptions::Default)? {
            if rec.body.len() == 32 {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&rec.body);
                return Ok(bytes);
            }
        }
        let bytes: [u8; 32] = rand::random();
        store.set(key, &[], &bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rev_tree::{current_rev_body, Rev, NONE};
    use tempfile::TempDir;

    fn open_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db"), DatabaseConfig::default()).unwrap();
        (dir, db)
    }

    fn leaf(id: &str, body: &[u8]) -> Rev {
        Rev {
            rev_id: id.as_bytes().to_vec(),
            parent_index: NONE,
            sequence: 0,
            flags: RevFlags::LEAF,
            body: body.to_vec(),
        }
    }

    #[test]
    fn create_read_update_assigns_sequences() {
        let (_dir, db) = open_db();
        db.begin_transaction().unwrap();
        let tree = RevTree::new(vec![leaf("1-aaa", b"A")]);
        let seq1 = db.put_document("doc1", &tree).unwrap();
        db.end_transaction(true).unwrap();
        assert_eq!(seq1, 1);

        let doc = db.get_document("doc1").unwrap();
        assert!(doc.exists);
        let body = current_rev_body(&doc.rev_tree.to_blob().unwrap()).unwrap();
        assert_eq!(body, b"A");
    }

    #[test]
    fn abort_leaves_no_trace() {
        let (_dir, db) = open_db();
        db.begin_transaction().unwrap();
        let tree = RevTree::new(vec![leaf("1-aaa", b"A")]);
        db.put_document("committed", &tree).unwrap();
        db.end_transaction(true).unwrap();

        db.begin_transaction().unwrap();
        let tree2 = RevTree::new(vec![leaf("1-zzz", b"Z")]);
        db.put_document("aborted", &tree2).unwrap();
        db.end_transaction(false).unwrap();

        assert!(db.get_document("committed").unwrap().exists);
        assert!(!db.get_document("aborted").unwrap().exists);
        assert!(!db.in_transaction());
    }

    #[test]
    fn nested_transactions_only_commit_once() {
        let (_dir, db) = open_db();
        db.begin_transaction().unwrap();
        db.begin_transaction().unwrap();
        assert!(db.in_transaction());
        db.end_transaction(true).unwrap();
        assert!(db.in_transaction());
        db.end_transaction(true).unwrap();
        assert!(!db.in_transaction());
    }

    #[test]
    fn close_refuses_inside_transaction() {
        let (_dir, db) = open_db();
        db.begin_transaction().unwrap();
        assert!(matches!(db.close(), Err(Error::TransactionNotClosed)));
        db.end_transaction(true).unwrap();
        assert!(db.close().is_ok());
    }

    #[test]
    fn uuid_is_stable_across_calls() {
        let (_dir, db) = open_db();
        let a = db.get_uuid(true).unwrap();
        let b = db.get_uuid(true).unwrap();
        assert_eq!(a, b);
        let private = db.get_uuid(false).unwrap();
        assert_ne!(a, private);
    }

    #[test]
    fn rekey_to_none_updates_config() {
        let (_dir, mut db) = open_db();
        db.rekey(EncryptionAlgorithm::None, None).unwrap();
        assert_eq!(db.config().encryption_algorithm, EncryptionAlgorithm::None);
    }

    #[test]
    fn rekey_to_real_algorithm_is_unimplemented() {
        let (_dir, mut db) = open_db();
        let err = db.rekey(EncryptionAlgorithm::Aes256, Some(vec![0u8; 32])).unwrap_err();
        assert!(matches!(err, Error::Unimplemented(_)));
    }

    #[test]
    fn rekey_refuses_inside_transaction() {
        let (_dir, mut db) = open_db();
        db.begin_transaction().unwrap();
        assert!(matches!(
            db.rekey(EncryptionAlgorithm::None, None),
            Err(Error::TransactionNotClosed)
        ));
        db.end_transaction(true).unwrap();
    }

    #[test]
    fn version_vectors_are_a_named_unimplemented_seam() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            versioning: Versioning::VersionVectors,
            ..Default::default()
        };
        let db = Database::open(dir.path().join("db"), config).unwrap();
        let err = db.get_document("anything").unwrap_err();
        assert!(matches!(err, Error::Unimplemented(_)));
    }
}
