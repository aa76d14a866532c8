//! Tests for page reclamation
//!
//! These tests verify:
//! - Pages freed by a commit are reused by later writers
//! - A live reader keeps the pages of its snapshot from being reused
//! - Large transactions spill dirty pages without changing their outcome
//! - The dirty page limit

use stratakv::{BucketFlags, Config, Database, PutFlags, StrataError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const ENTRIES: u32 = 2000;

fn setup_temp_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().path(temp_dir.path().join("test.db")).build();
    let db = Database::open(config).unwrap();
    (temp_dir, db)
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{:06}", i).into_bytes()
}

fn insert_all(db: &Database, fill: u8) {
    db.update(|txn| {
        let b = txn.create_bucket("B", BucketFlags::empty())?;
        for i in 0..ENTRIES {
            txn.put(&b, &key(i), &[fill; 80], PutFlags::empty())?;
        }
        Ok(())
    })
    .unwrap();
}

fn delete_all(db: &Database) {
    db.update(|txn| {
        let b = txn.open_bucket("B")?;
        for i in 0..ENTRIES {
            txn.del(&b, &key(i), None)?;
        }
        Ok(())
    })
    .unwrap();
}

fn free_pages(db: &Database) -> u64 {
    db.view(|txn| txn.free_page_count()).unwrap()
}

// =============================================================================
// Reuse Tests
// =============================================================================

#[test]
fn test_freed_pages_are_recorded() {
    let (_temp, db) = setup_temp_db();
    insert_all(&db, 1);
    let before = free_pages(&db);

    delete_all(&db);
    assert!(free_pages(&db) > before + 10);
}

#[test]
fn test_pages_reused_after_delete() {
    let (_temp, db) = setup_temp_db();

    insert_all(&db, 1);
    let grown = db.info().last_page;

    delete_all(&db);
    let after_delete = db.info().last_page;

    insert_all(&db, 2);
    let after_reinsert = db.info().last_page;

    // Without reuse the second fill would need about as many new pages as
    // the first one
    assert!(
        after_reinsert < after_delete + grown / 2,
        "last page {} -> {} -> {}",
        grown,
        after_delete,
        after_reinsert
    );

    db.view(|txn| {
        let b = txn.open_bucket("B")?;
        assert_eq!(txn.stat(&b)?.entries, ENTRIES as u64);
        assert_eq!(txn.get(&b, &key(1234))?, vec![2u8; 80]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_file_stays_bounded_under_churn() {
    let (_temp, db) = setup_temp_db();
    insert_all(&db, 0);
    let baseline = db.info().last_page;

    for round in 1..=10u8 {
        db.update(|txn| {
            let b = txn.open_bucket("B")?;
            for i in (0..ENTRIES).step_by(7) {
                txn.put(&b, &key(i), &[round; 80], PutFlags::empty())?;
            }
            Ok(())
        })
        .unwrap();
    }

    // One round of copies plus the free list, not one per round
    assert!(db.info().last_page < baseline * 3, "grew from {} to {}", baseline, db.info().last_page);
}

/// Fill a fresh bucket, then delete and rewrite every entry, optionally
/// inside a nested transaction. Returns the last page of the file.
fn rewrite_in_one_txn(nested: bool) -> u64 {
    let (_temp, db) = setup_temp_db();
    let txn = db.begin_write().unwrap();
    let b = txn.create_bucket("B", BucketFlags::empty()).unwrap();
    for i in 0..ENTRIES {
        txn.put(&b, &key(i), &[1; 80], PutFlags::empty()).unwrap();
    }

    if nested {
        txn.begin_nested().unwrap();
    }
    for i in 0..ENTRIES {
        txn.del(&b, &key(i), None).unwrap();
    }
    for i in 0..ENTRIES {
        txn.put(&b, &key(i), &[2; 80], PutFlags::empty()).unwrap();
    }
    if nested {
        txn.commit_nested().unwrap();
    }
    txn.commit().unwrap();

    let values = db
        .view(|txn| {
            let b = txn.open_bucket("B")?;
            (0..ENTRIES).map(|i| txn.get(&b, &key(i))).collect::<Result<Vec<_>, _>>()
        })
        .unwrap();
    assert!(values.iter().all(|v| v[..] == [2u8; 80]));
    db.info().last_page
}

#[test]
fn test_child_reuses_pages_freshly_allocated_by_parent() {
    let flat = rewrite_in_one_txn(false);
    let nested = rewrite_in_one_txn(true);
    assert_eq!(nested, flat);
}

#[test]
fn test_aborted_child_keeps_parent_pages() {
    let (_temp, db) = setup_temp_db();
    let txn = db.begin_write().unwrap();
    let b = txn.create_bucket("B", BucketFlags::empty()).unwrap();
    for i in 0..ENTRIES {
        txn.put(&b, &key(i), &[1; 80], PutFlags::empty()).unwrap();
    }

    txn.begin_nested().unwrap();
    for i in 0..ENTRIES {
        txn.del(&b, &key(i), None).unwrap();
    }
    // Overwrites whatever the child released
    for i in 0..ENTRIES / 2 {
        txn.put(&b, &key(ENTRIES + i), &[9; 80], PutFlags::empty()).unwrap();
    }
    txn.abort_nested().unwrap();

    for i in 0..ENTRIES {
        assert_eq!(txn.get(&b, &key(i)).unwrap(), [1; 80]);
    }
    txn.commit().unwrap();

    db.view(|txn| {
        let b = txn.open_bucket("B")?;
        assert_eq!(txn.stat(&b)?.entries, ENTRIES as u64);
        for i in 0..ENTRIES {
            assert_eq!(txn.get(&b, &key(i))?, [1; 80]);
        }
        assert!(matches!(txn.get(&b, &key(ENTRIES)), Err(StrataError::NotFound)));
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Reader Protection Tests
// =============================================================================

#[test]
fn test_live_reader_blocks_reuse() {
    let (_temp, db) = setup_temp_db();
    insert_all(&db, 1);
    let grown = db.info().last_page;

    let reader = db.begin_read().unwrap();
    let snapshot = reader.open_bucket("B").unwrap();

    delete_all(&db);
    let after_delete = db.info().last_page;
    insert_all(&db, 2);
    let after_reinsert = db.info().last_page;

    // The pages of the reader's snapshot were not handed out again
    assert!(after_reinsert >= after_delete + grown / 2);
    for i in 0..ENTRIES {
        assert_eq!(reader.get(&snapshot, &key(i)).unwrap(), vec![1u8; 80]);
    }

    let mut cursor = reader.cursor(&snapshot).unwrap();
    let mut count = 0;
    let mut entry = cursor.first();
    while entry.is_ok() {
        count += 1;
        entry = cursor.next();
    }
    assert_eq!(count, ENTRIES);
}

#[test]
fn test_reuse_resumes_after_reader_finishes() {
    let (_temp, db) = setup_temp_db();
    insert_all(&db, 1);
    let grown = db.info().last_page;

    let reader = db.begin_read().unwrap();
    delete_all(&db);
    reader.abort();

    let after_delete = db.info().last_page;
    insert_all(&db, 2);
    assert!(db.info().last_page < after_delete + grown / 2);
}

// =============================================================================
// Spill Tests
// =============================================================================

#[test]
fn test_spilled_transaction_commits() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("test.db"))
        .spill_threshold(16)
        .build();
    let db = Database::open(config).unwrap();

    db.update(|txn| {
        let b = txn.create_bucket("B", BucketFlags::empty())?;
        for i in 0..ENTRIES {
            txn.put(&b, &key(i), &[7u8; 80], PutFlags::empty())?;
        }
        // Spilled pages are still read back correctly
        assert_eq!(txn.get(&b, &key(3))?, vec![7u8; 80]);
        for i in (0..ENTRIES).step_by(2) {
            txn.del(&b, &key(i), None)?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|txn| {
        let b = txn.open_bucket("B")?;
        assert_eq!(txn.stat(&b)?.entries, ENTRIES as u64 / 2);
        assert!(matches!(txn.get(&b, &key(0)), Err(StrataError::NotFound)));
        assert_eq!(txn.get(&b, &key(1))?, vec![7u8; 80]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_spilled_transaction_aborts_cleanly() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("test.db"))
        .spill_threshold(16)
        .build();
    let db = Database::open(config).unwrap();
    insert_all(&db, 1);
    let info = db.info();

    let txn = db.begin_write().unwrap();
    let b = txn.open_bucket("B").unwrap();
    for i in 0..ENTRIES {
        txn.put(&b, &key(i), &[9u8; 80], PutFlags::empty()).unwrap();
    }
    txn.abort();

    assert_eq!(db.info().last_txnid, info.last_txnid);
    db.view(|txn| {
        let b = txn.open_bucket("B")?;
        for i in 0..ENTRIES {
            assert_eq!(txn.get(&b, &key(i))?, vec![1u8; 80]);
        }
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Dirty Limit Tests
// =============================================================================

#[test]
fn test_nested_child_hits_dirty_limit() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("test.db"))
        .spill_threshold(32)
        .max_dirty_pages(64)
        .build();
    let db = Database::open(config).unwrap();

    let txn = db.begin_write().unwrap();
    let b = txn.create_bucket("B", BucketFlags::empty()).unwrap();
    txn.put(&b, b"before", b"1", PutFlags::empty()).unwrap();

    txn.begin_nested().unwrap();
    let mut result = Ok(());
    for i in 0..ENTRIES {
        result = txn.put(&b, &key(i), &[3u8; 80], PutFlags::empty());
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(StrataError::TransactionTooBig)));

    // The failure belongs to the child; the parent carries on
    txn.abort_nested().unwrap();
    txn.put(&b, b"after", b"2", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    db.view(|txn| {
        let b = txn.open_bucket("B")?;
        assert_eq!(txn.get(&b, b"before")?, b"1");
        assert_eq!(txn.get(&b, b"after")?, b"2");
        assert!(matches!(txn.get(&b, &key(0)), Err(StrataError::NotFound)));
        Ok(())
    })
    .unwrap();
}
