//! embeddb: the core of an embedded, syncing document database.
//!
//! Four subsystems, in dependency order:
//!
//! 1. [`record_store`] — transactional key/value storage over SQLite, with
//!    sequence numbering and key/sequence-ordered enumeration.
//! 2. [`rev_tree`] — per-document revision history: a compact binary codec
//!    plus the tree operations (insert, prune, current-revision selection)
//!    built on top of it.
//! 3. [`blob_store`] — a content-addressed (SHA-1) filesystem blob store
//!    with a streaming, atomically-installed writer.
//! 4. [`replicator`] — a bidirectional push/pull replicator built over the
//!    [`blip`] framed message protocol, driven by the [`actor`] runtime.
//!
//! [`database`] binds the first three into one transactional facade;
//! [`sequence_tracker`] feeds the replicator's pusher and any other
//! change-feed listeners.

pub mod actor;
pub mod blip;
pub mod blob_store;
pub mod database;
pub mod error;
pub mod record_store;
pub mod replicator;
pub mod rev_tree;
pub mod sequence_tracker;

pub use database::{Database, DatabaseConfig};
pub use error::{Error, Result};

/// Installs a `tracing` subscriber reading verbosity from `RUST_LOG`
/// (§2.1), e.g. `RUST_LOG=embeddb::replicator=debug`. Call once at process
/// startup; a no-op if a subscriber is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
