//! End-to-end coverage spanning the record store, rev-tree, and blob store
//! through the `Database` facade (§8 scenarios 1-5).

use embeddb::database::{Database, DatabaseConfig};
use embeddb::rev_tree::{Rev, RevFlags, RevTree, NONE};
use tempfile::TempDir;

fn open() -> (TempDir, Database) {
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
fn create_read_update() {
    let (_dir, db) = open();

    db.begin_transaction().unwrap();
    let seq1 = db.put_document("a", &RevTree::new(vec![leaf("1-aaa", b"A")])).unwrap();
    db.end_transaction(true).unwrap();
    assert_eq!(seq1, 1);

    let doc = db.get_document("a").unwrap();
    assert!(doc.exists);
    assert!(!doc.deleted);

    db.begin_transaction().unwrap();
    let mut tree = doc.rev_tree.clone();
    tree.insert(doc.current_rev_index.unwrap() as u16, leaf("2-bbb", b"B")).unwrap();
    let seq2 = db.put_document("a", &tree).unwrap();
    db.end_transaction(true).unwrap();
    assert_eq!(seq2, 2);

    let doc = db.get_document("a").unwrap();
    let current = doc.rev_tree.get(doc.current_rev_index.unwrap()).unwrap();
    assert_eq!(current.rev_id, b"2-bbb");
    assert_eq!(current.body, b"B");
}

#[test]
fn range_enumerate_respects_inclusivity() {
    let (_dir, db) = open();
    db.begin_transaction().unwrap();
    for i in 1..=100u32 {
        let doc_id = format!("rec-{:03}", i);
        db.put_document(&doc_id, &RevTree::new(vec![leaf("1-x", b"x")])).unwrap();
    }
    db.end_transaction(true).unwrap();

    let mut range = embeddb::record_store::KeyRange::new();
    range.min = Some(b"rec-024".to_vec());
    range.max = Some(b"rec-029".to_vec());
    let inclusive = db.default_key_store().enumerate_by_key(&range).unwrap();
    assert_eq!(inclusive.len(), 6);

    range.min_inclusive = false;
    range.max_inclusive = false;
    let exclusive = db.default_key_store().enumerate_by_key(&range).unwrap();
    assert_eq!(exclusive.len(), 4);
}

#[test]
fn abort_transaction_hides_writes() {
    let (_dir, db) = open();
    db.begin_transaction().unwrap();
    db.put_document("a", &RevTree::new(vec![leaf("1-aaa", b"A")])).unwrap();
    db.end_transaction(true).unwrap();

    db.begin_transaction().unwrap();
    db.put_document("a", &RevTree::new(vec![leaf("1-zzz", b"Z")])).unwrap();
    db.put_document("x", &RevTree::new(vec![leaf("1-new", b"X")])).unwrap();
    db.end_transaction(false).unwrap();

    // Aborting rolls back the pending SQL transaction entirely — writes
    // issued only inside it, committed or not, are never visible.
    let doc_x = db.get_document("x").unwrap();
    assert!(!doc_x.exists);
}

#[test]
fn blob_round_trip_through_database_blob_store() {
    let (_dir, db) = open();
    let data = vec![7u8; 1024 * 1024];
    let blob = db.blob_store().put(&data).unwrap();
    assert_eq!(blob.contents().unwrap(), data);

    let blob2 = db.blob_store().put(&data).unwrap();
    assert_eq!(blob.path(), blob2.path());
    assert_eq!(db.blob_store().count().unwrap(), 1);
}

#[test]
fn rev_tree_encode_decode_preserves_fields() {
    let revs = vec![
        leaf("1-a", b"x"),
        Rev {
            parent_index: 0,
            ..leaf("2-b", b"y")
        },
        Rev {
            parent_index: 0,
            flags: RevFlags::LEAF | RevFlags::DELETED,
            ..leaf("2-c", b"")
        },
    ];
    let tree = RevTree::new(revs.clone());
    let blob = tree.to_blob().unwrap();
    let decoded = RevTree::from_blob(&blob, 0).unwrap();
    assert_eq!(decoded.len(), revs.len());
    for (original, restored) in revs.iter().zip(decoded.revs()) {
        assert_eq!(original.rev_id, restored.rev_id);
        assert_eq!(original.parent_index, restored.parent_index);
        assert_eq!(original.body, restored.body);
    }
}
