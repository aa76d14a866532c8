//! Tests for sorted duplicates
//!
//! These tests verify:
//! - Duplicate ordering and traversal (next/prev, *_dup, *_nodup)
//! - count, seek and seek_both
//! - Deleting single duplicates and whole keys
//! - DUP_FIXED and INTEGER_DUP buckets
//! - Promotion of large duplicate sets to sub-trees

use stratakv::{Bucket, BucketFlags, Config, Database, PutFlags, StrataError, Transaction};
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

fn put_all(txn: &Transaction<'_>, b: &Bucket, key: &[u8], values: &[&[u8]]) {
    for value in values {
        txn.put(b, key, value, PutFlags::empty()).unwrap();
    }
}

/// Bucket "D": a -> {1, 2, 3}, b -> {x}, c -> {p, q}
fn populate(db: &Database) {
    db.update(|txn| {
        let b = txn.create_bucket("D", BucketFlags::DUP_SORT)?;
        put_all(txn, &b, b"a", &[b"3", b"1", b"2"]);
        put_all(txn, &b, b"b", &[b"x"]);
        put_all(txn, &b, b"c", &[b"q", b"p"]);
        Ok(())
    })
    .unwrap();
}

fn pair(k: &[u8], v: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (k.to_vec(), v.to_vec())
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_duplicates_iterate_in_order() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.view(|txn| {
        let b = txn.open_bucket("D")?;
        let mut cursor = txn.cursor(&b)?;
        let mut seen = Vec::new();
        let mut entry = cursor.first();
        while let Ok(kv) = entry {
            seen.push(kv);
            entry = cursor.next();
        }
        assert_eq!(
            seen,
            vec![
                pair(b"a", b"1"),
                pair(b"a", b"2"),
                pair(b"a", b"3"),
                pair(b"b", b"x"),
                pair(b"c", b"p"),
                pair(b"c", b"q"),
            ]
        );

        // And backwards
        let mut reversed = Vec::new();
        let mut entry = cursor.last();
        while let Ok(kv) = entry {
            reversed.push(kv);
            entry = cursor.prev();
        }
        seen.reverse();
        assert_eq!(reversed, seen);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_get_returns_first_duplicate() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.view(|txn| {
        let b = txn.open_bucket("D")?;
        assert_eq!(txn.get(&b, b"a")?, b"1");
        assert_eq!(txn.get(&b, b"c")?, b"p");
        assert_eq!(txn.stat(&b)?.entries, 6);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_duplicate_pair_is_stored_once() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.update(|txn| {
        let b = txn.open_bucket("D")?;
        txn.put(&b, b"a", b"2", PutFlags::empty())?;
        assert!(matches!(
            txn.put(&b, b"a", b"2", PutFlags::NO_DUP_DATA),
            Err(StrataError::KeyExists)
        ));
        assert!(matches!(
            txn.put(&b, b"a", b"9", PutFlags::NO_OVERWRITE),
            Err(StrataError::KeyExists)
        ));

        let mut cursor = txn.cursor(&b)?;
        cursor.seek(b"a")?;
        assert_eq!(cursor.count()?, 3);
        assert_eq!(txn.stat(&b)?.entries, 6);
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Navigation Tests
// =============================================================================

#[test]
fn test_dup_navigation() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.view(|txn| {
        let b = txn.open_bucket("D")?;
        let mut cursor = txn.cursor(&b)?;

        assert_eq!(cursor.seek(b"a")?, pair(b"a", b"1"));
        assert_eq!(cursor.next_dup()?, pair(b"a", b"2"));
        assert_eq!(cursor.next_dup()?, pair(b"a", b"3"));
        assert!(matches!(cursor.next_dup(), Err(StrataError::NotFound)));
        assert_eq!(cursor.current()?, pair(b"a", b"3"));

        assert_eq!(cursor.first_dup()?, pair(b"a", b"1"));
        assert!(matches!(cursor.prev_dup(), Err(StrataError::NotFound)));
        assert_eq!(cursor.last_dup()?, pair(b"a", b"3"));
        assert_eq!(cursor.prev_dup()?, pair(b"a", b"2"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_nodup_navigation() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.view(|txn| {
        let b = txn.open_bucket("D")?;
        let mut cursor = txn.cursor(&b)?;

        assert_eq!(cursor.next_nodup()?, pair(b"a", b"1"));
        assert_eq!(cursor.next_nodup()?, pair(b"b", b"x"));
        assert_eq!(cursor.next_nodup()?, pair(b"c", b"p"));
        assert!(matches!(cursor.next_nodup(), Err(StrataError::NotFound)));

        assert_eq!(cursor.prev_nodup()?, pair(b"b", b"x"));
        assert_eq!(cursor.prev_nodup()?, pair(b"a", b"3"));
        assert!(matches!(cursor.prev_nodup(), Err(StrataError::NotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_count_per_key() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.view(|txn| {
        let b = txn.open_bucket("D")?;
        let mut cursor = txn.cursor(&b)?;
        assert!(matches!(cursor.count(), Err(StrataError::NotFound)));

        let mut counts = Vec::new();
        let mut entry = cursor.next_nodup();
        while let Ok((k, _)) = entry {
            counts.push((k, cursor.count()?));
            entry = cursor.next_nodup();
        }
        assert_eq!(counts, vec![(b"a".to_vec(), 3), (b"b".to_vec(), 1), (b"c".to_vec(), 2)]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_seek_both() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.view(|txn| {
        let b = txn.open_bucket("D")?;
        let mut cursor = txn.cursor(&b)?;

        assert_eq!(cursor.seek_both(b"a", b"2")?, pair(b"a", b"2"));
        assert_eq!(cursor.next()?, pair(b"a", b"3"));
        assert_eq!(cursor.seek_both(b"c", b"q")?, pair(b"c", b"q"));

        assert!(matches!(cursor.seek_both(b"a", b"4"), Err(StrataError::NotFound)));
        assert!(matches!(cursor.seek_both(b"zz", b"1"), Err(StrataError::NotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_dup_operations_need_dup_bucket() {
    let (_temp, db) = setup_temp_db();
    db.update(|txn| {
        let b = txn.create_bucket("plain", BucketFlags::empty())?;
        txn.put(&b, b"k", b"v", PutFlags::empty())?;

        let mut cursor = txn.cursor(&b)?;
        cursor.first()?;
        assert!(matches!(cursor.next_dup(), Err(StrataError::IncompatibleFlags)));
        assert!(matches!(cursor.first_dup(), Err(StrataError::IncompatibleFlags)));
        assert_eq!(cursor.count()?, 1);

        // Plain buckets keep one value per key
        txn.put(&b, b"k", b"w", PutFlags::empty())?;
        assert_eq!(txn.get(&b, b"k")?, b"w");
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_single_duplicate() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.update(|txn| {
        let b = txn.open_bucket("D")?;
        txn.del(&b, b"a", Some(b"2"))?;
        assert!(matches!(txn.del(&b, b"a", Some(b"2")), Err(StrataError::NotFound)));

        let mut cursor = txn.cursor(&b)?;
        cursor.seek(b"a")?;
        assert_eq!(cursor.count()?, 2);
        assert_eq!(cursor.next_dup()?, pair(b"a", b"3"));
        Ok(())
    })
    .unwrap();

    // Deleting the last duplicate removes the key
    db.update(|txn| {
        let b = txn.open_bucket("D")?;
        txn.del(&b, b"b", Some(b"x"))?;
        assert!(matches!(txn.get(&b, b"b"), Err(StrataError::NotFound)));
        assert_eq!(txn.stat(&b)?.entries, 4);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_all_duplicates_of_key() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.update(|txn| {
        let b = txn.open_bucket("D")?;
        txn.del(&b, b"a", None)?;
        assert!(matches!(txn.get(&b, b"a"), Err(StrataError::NotFound)));
        assert_eq!(txn.stat(&b)?.entries, 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_delete_in_dup_bucket() {
    let (_temp, db) = setup_temp_db();
    populate(&db);

    db.update(|txn| {
        let b = txn.open_bucket("D")?;
        let mut cursor = txn.cursor(&b)?;

        cursor.seek_both(b"a", b"2")?;
        cursor.delete()?;
        assert_eq!(cursor.next()?, pair(b"a", b"3"));

        cursor.seek(b"c")?;
        cursor.delete_dups()?;
        assert!(matches!(cursor.next(), Err(StrataError::NotFound)));
        assert_eq!(cursor.prev()?, pair(b"b", b"x"));

        assert_eq!(txn.stat(&b)?.entries, 3);
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Fixed-Size and Integer Duplicate Tests
// =============================================================================

#[test]
fn test_dup_fixed_rejects_other_sizes() {
    let (_temp, db) = setup_temp_db();

    db.update(|txn| {
        let b = txn.create_bucket("F", BucketFlags::DUP_SORT | BucketFlags::DUP_FIXED)?;
        txn.put(&b, b"k", b"aaaa", PutFlags::empty())?;
        txn.put(&b, b"k", b"cccc", PutFlags::empty())?;
        txn.put(&b, b"k", b"bbbb", PutFlags::empty())?;
        assert!(matches!(
            txn.put(&b, b"k", b"toolong", PutFlags::empty()),
            Err(StrataError::BadValueSize(_))
        ));

        // Another key may pick its own size
        txn.put(&b, b"other", b"xy", PutFlags::empty())?;

        let mut cursor = txn.cursor(&b)?;
        cursor.seek(b"k")?;
        assert_eq!(cursor.count()?, 3);
        assert_eq!(cursor.last_dup()?, pair(b"k", b"cccc"));
        assert_eq!(cursor.prev_dup()?, pair(b"k", b"bbbb"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_integer_dups_sort_numerically() {
    let (_temp, db) = setup_temp_db();

    db.update(|txn| {
        let b = txn.create_bucket("I", BucketFlags::DUP_SORT | BucketFlags::INTEGER_DUP)?;
        for n in [300u32, 2, 70_000, 1, 256] {
            txn.put(&b, b"k", &n.to_le_bytes(), PutFlags::empty())?;
        }
        assert!(matches!(
            txn.put(&b, b"k", b"abc", PutFlags::empty()),
            Err(StrataError::BadValueSize(_))
        ));
        Ok(())
    })
    .unwrap();

    db.view(|txn| {
        let b = txn.open_bucket("I")?;
        let mut cursor = txn.cursor(&b)?;
        let mut values = Vec::new();
        let mut entry = cursor.first();
        while let Ok((_, v)) = entry {
            values.push(u32::from_le_bytes(v.as_slice().try_into().unwrap()));
            entry = cursor.next();
        }
        assert_eq!(values, vec![1, 2, 256, 300, 70_000]);
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Sub-Tree Promotion Tests
// =============================================================================

#[test]
fn test_large_duplicate_set_promotes_to_subtree() {
    let (_temp, db) = setup_temp_db();
    let dup = |i: u32| format!("dup-{:05}-{}", i, "v".repeat(10)).into_bytes();

    db.update(|txn| {
        let b = txn.create_bucket("D", BucketFlags::DUP_SORT)?;
        for i in (0..600).rev() {
            txn.put(&b, b"many", &dup(i), PutFlags::empty())?;
        }
        txn.put(&b, b"after", b"1", PutFlags::empty())?;
        txn.put(&b, b"zzz", b"1", PutFlags::empty())
    })
    .unwrap();

    db.view(|txn| {
        let b = txn.open_bucket("D")?;
        assert_eq!(txn.stat(&b)?.entries, 602);

        let mut cursor = txn.cursor(&b)?;
        cursor.seek(b"many")?;
        assert_eq!(cursor.count()?, 600);

        let mut expected = 0;
        let mut entry = cursor.current();
        while let Ok((k, v)) = entry {
            assert_eq!(k, b"many");
            assert_eq!(v, dup(expected));
            expected += 1;
            entry = cursor.next_dup();
        }
        assert_eq!(expected, 600);

        assert_eq!(cursor.next()?, pair(b"zzz", b"1"));
        assert_eq!(cursor.seek_both(b"many", &dup(321))?.1, dup(321));
        assert_eq!(cursor.prev()?.1, dup(320));
        Ok(())
    })
    .unwrap();

    // Shrink the set again, deleting through both paths
    db.update(|txn| {
        let b = txn.open_bucket("D")?;
        for i in (0..600).filter(|i| i % 3 != 0) {
            txn.del(&b, b"many", Some(&dup(i)))?;
        }
        let mut cursor = txn.cursor(&b)?;
        cursor.seek(b"many")?;
        assert_eq!(cursor.count()?, 200);
        assert_eq!(cursor.next_dup()?.1, dup(3));

        cursor.delete_dups()?;
        assert_eq!(txn.stat(&b)?.entries, 2);
        assert_eq!(cursor.next()?, pair(b"zzz", b"1"));
        Ok(())
    })
    .unwrap();
}
