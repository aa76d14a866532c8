//! Tests for named buckets
//!
//! These tests verify:
//! - Create, open, drop and clear
//! - Flag validation and persistence
//! - Handle validity across transactions
//! - Bucket statistics

use stratakv::{BucketFlags, Config, Database, PutFlags, StrataError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().path(temp_dir.path().join("test.db")).build();
    let db = Database::open(config).unwrap();
    (temp_dir, db)
}

fn fill(db: &Database, name: &str, count: u32) {
    db.update(|txn| {
        let b = txn.create_bucket(name, BucketFlags::empty())?;
        for i in 0..count {
            txn.put(&b, format!("key-{:05}", i).as_bytes(), &[i as u8; 100], PutFlags::empty())?;
        }
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Create / Open Tests
// =============================================================================

#[test]
fn test_create_and_open_bucket() {
    let (_temp, db) = setup_temp_db();

    db.update(|txn| {
        let b = txn.create_bucket("users", BucketFlags::empty())?;
        txn.put(&b, b"alice", b"admin", PutFlags::empty())
    })
    .unwrap();

    let value = db
        .view(|txn| {
            let b = txn.open_bucket("users")?;
            txn.get(&b, b"alice")
        })
        .unwrap();
    assert_eq!(value, b"admin");
}

#[test]
fn test_open_missing_bucket() {
    let (_temp, db) = setup_temp_db();
    let result = db.view(|txn| txn.open_bucket("nope"));
    assert!(matches!(result, Err(StrataError::NotFound)));
}

#[test]
fn test_create_existing_bucket_returns_it() {
    let (_temp, db) = setup_temp_db();
    fill(&db, "B", 10);

    db.update(|txn| {
        let first = txn.create_bucket("B", BucketFlags::empty())?;
        let again = txn.create_bucket("B", BucketFlags::empty())?;
        assert_eq!(first, again);
        assert_eq!(txn.stat(&again)?.entries, 10);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_buckets_are_independent() {
    let (_temp, db) = setup_temp_db();

    db.update(|txn| {
        let a = txn.create_bucket("a", BucketFlags::empty())?;
        let b = txn.create_bucket("b", BucketFlags::empty())?;
        txn.put(&a, b"k", b"from-a", PutFlags::empty())?;
        txn.put(&b, b"k", b"from-b", PutFlags::empty())
    })
    .unwrap();

    db.view(|txn| {
        let a = txn.open_bucket("a")?;
        let b = txn.open_bucket("b")?;
        assert_eq!(txn.get(&a, b"k")?, b"from-a");
        assert_eq!(txn.get(&b, b"k")?, b"from-b");
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_bucket_names_sorted() {
    let (_temp, db) = setup_temp_db();
    db.update(|txn| {
        for name in ["orders", "accounts", "sessions"] {
            txn.create_bucket(name, BucketFlags::empty())?;
        }
        Ok(())
    })
    .unwrap();

    let names = db.view(|txn| txn.bucket_names()).unwrap();
    assert_eq!(names, vec!["accounts", "orders", "sessions"]);
}

#[test]
fn test_empty_bucket_name_rejected() {
    let (_temp, db) = setup_temp_db();
    let result = db.update(|txn| txn.create_bucket("", BucketFlags::empty()));
    assert!(matches!(result, Err(StrataError::BadValueSize(_))));
}

// =============================================================================
// Flag Tests
// =============================================================================

#[test]
fn test_flags_persist() {
    let (_temp, db) = setup_temp_db();
    let flags = BucketFlags::DUP_SORT | BucketFlags::DUP_FIXED;
    db.update(|txn| txn.create_bucket("fixed", flags).map(|_| ())).unwrap();

    let opened = db.view(|txn| txn.open_bucket("fixed")).unwrap();
    assert_eq!(opened.flags(), flags);
}

#[test]
fn test_create_with_other_flags_is_incompatible() {
    let (_temp, db) = setup_temp_db();
    db.update(|txn| txn.create_bucket("B", BucketFlags::DUP_SORT).map(|_| ())).unwrap();

    let result = db.update(|txn| txn.create_bucket("B", BucketFlags::empty()));
    assert!(matches!(result, Err(StrataError::IncompatibleFlags)));

    // Same check for a bucket opened earlier in the same transaction
    let result = db.update(|txn| {
        txn.create_bucket("C", BucketFlags::INTEGER_KEY)?;
        txn.create_bucket("C", BucketFlags::empty())
    });
    assert!(matches!(result, Err(StrataError::IncompatibleFlags)));
}

#[test]
fn test_dup_only_flags_require_dup_sort() {
    let (_temp, db) = setup_temp_db();
    for flags in [BucketFlags::DUP_FIXED, BucketFlags::INTEGER_DUP] {
        let result = db.update(|txn| txn.create_bucket("bad", flags));
        assert!(matches!(result, Err(StrataError::IncompatibleFlags)));
    }
}

#[test]
fn test_read_transaction_cannot_create() {
    let (_temp, db) = setup_temp_db();
    fill(&db, "exists", 1);

    db.view(|txn| {
        assert!(matches!(
            txn.create_bucket("new", BucketFlags::empty()),
            Err(StrataError::ReadOnly)
        ));
        // Creating an existing bucket just opens it
        txn.create_bucket("exists", BucketFlags::empty())?;
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Handle Tests
// =============================================================================

#[test]
fn test_handle_from_other_transaction_rejected() {
    let (_temp, db) = setup_temp_db();
    fill(&db, "B", 1);

    let first = db.begin_read().unwrap();
    let handle = first.open_bucket("B").unwrap();

    let second = db.begin_read().unwrap();
    assert!(matches!(second.get(&handle, b"key-00000"), Err(StrataError::BadBucket)));
    assert!(matches!(second.cursor(&handle), Err(StrataError::BadBucket)));
}

#[test]
fn test_bucket_limit() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("test.db"))
        .max_buckets(2)
        .build();
    let db = Database::open(config).unwrap();

    let result = db.update(|txn| {
        txn.create_bucket("one", BucketFlags::empty())?;
        txn.create_bucket("two", BucketFlags::empty())?;
        txn.create_bucket("three", BucketFlags::empty())
    });
    assert!(matches!(result, Err(StrataError::BucketFull)));

    // Opening an already open bucket does not count again
    db.update(|txn| {
        txn.create_bucket("one", BucketFlags::empty())?;
        txn.create_bucket("two", BucketFlags::empty())?;
        txn.open_bucket("one")?;
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Drop / Clear Tests
// =============================================================================

#[test]
fn test_drop_bucket() {
    let (_temp, db) = setup_temp_db();
    fill(&db, "gone", 50);
    fill(&db, "kept", 5);

    db.update(|txn| {
        let b = txn.open_bucket("gone")?;
        txn.drop_bucket(b)?;
        assert!(matches!(txn.get(&b, b"key-00000"), Err(StrataError::BadBucket)));
        assert!(matches!(txn.open_bucket("gone"), Err(StrataError::NotFound)));
        Ok(())
    })
    .unwrap();

    assert_eq!(db.view(|txn| txn.bucket_names()).unwrap(), vec!["kept"]);
    assert!(matches!(db.view(|txn| txn.open_bucket("gone")), Err(StrataError::NotFound)));

    // The name can be reused with different flags
    db.update(|txn| txn.create_bucket("gone", BucketFlags::DUP_SORT).map(|_| ())).unwrap();
    let stat = db
        .view(|txn| {
            let b = txn.open_bucket("gone")?;
            txn.stat(&b)
        })
        .unwrap();
    assert_eq!(stat.entries, 0);
}

#[test]
fn test_drop_bucket_releases_pages() {
    let (_temp, db) = setup_temp_db();
    fill(&db, "big", 2000);

    let (stat, before) = db
        .view(|txn| {
            let b = txn.open_bucket("big")?;
            Ok((txn.stat(&b)?, txn.free_page_count()?))
        })
        .unwrap();
    let tree_pages = stat.leaf_pages + stat.branch_pages;
    assert!(tree_pages > 20);

    db.update(|txn| {
        let b = txn.open_bucket("big")?;
        txn.drop_bucket(b)
    })
    .unwrap();

    let after = db.view(|txn| txn.free_page_count()).unwrap();
    assert!(after >= before + tree_pages / 2, "free pages {} -> {}", before, after);
}

#[test]
fn test_drop_aborted_keeps_bucket() {
    let (_temp, db) = setup_temp_db();
    fill(&db, "B", 20);

    let txn = db.begin_write().unwrap();
    let b = txn.open_bucket("B").unwrap();
    txn.drop_bucket(b).unwrap();
    txn.abort();

    let stat = db
        .view(|txn| {
            let b = txn.open_bucket("B")?;
            txn.stat(&b)
        })
        .unwrap();
    assert_eq!(stat.entries, 20);
}

#[test]
fn test_clear_bucket() {
    let (_temp, db) = setup_temp_db();
    fill(&db, "B", 300);

    db.update(|txn| {
        let b = txn.open_bucket("B")?;
        txn.clear_bucket(&b)?;
        assert_eq!(txn.stat(&b)?.entries, 0);
        txn.put(&b, b"fresh", b"1", PutFlags::empty())
    })
    .unwrap();

    db.view(|txn| {
        let b = txn.open_bucket("B")?;
        let stat = txn.stat(&b)?;
        assert_eq!(stat.entries, 1);
        assert_eq!(stat.depth, 1);
        assert!(matches!(txn.get(&b, b"key-00001"), Err(StrataError::NotFound)));
        assert_eq!(txn.get(&b, b"fresh")?, b"1");
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Stat Tests
// =============================================================================

#[test]
fn test_stat_tracks_growth() {
    let (_temp, db) = setup_temp_db();
    db.update(|txn| txn.create_bucket("B", BucketFlags::empty()).map(|_| ())).unwrap();

    let empty = db
        .view(|txn| {
            let b = txn.open_bucket("B")?;
            txn.stat(&b)
        })
        .unwrap();
    assert_eq!(empty.entries, 0);
    assert_eq!(empty.depth, 0);
    assert_eq!(empty.leaf_pages, 0);
    assert_eq!(empty.page_size, 4096);

    fill(&db, "B", 1000);
    let full = db
        .view(|txn| {
            let b = txn.open_bucket("B")?;
            txn.stat(&b)
        })
        .unwrap();
    assert_eq!(full.entries, 1000);
    assert!(full.depth >= 2);
    assert!(full.branch_pages >= 1);
    assert!(full.leaf_pages > 10);
    assert_eq!(full.overflow_pages, 0);
}
