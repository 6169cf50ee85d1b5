//! Summary: Transaction lifecycle tests: commit, rollback, isolation.
//! Copyright (c) YOAB. All rights reserved.

use pirin::{Database, Error, Options};
use tempfile::TempDir;

fn create_test_db() -> (Database, TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tx.db");
    let db = Database::open(&path, Options::default()).expect("open");
    (db, dir, path)
}

// ==================== Rollback Tests ====================

#[test]
fn test_rollback_discards_created_bucket() {
    let (db, _dir, _path) = create_test_db();

    let tx = db.begin(true);
    {
        let mut bucket = tx.create_bucket(b"test").unwrap();
        for index in 0..5000u64 {
            bucket
                .put(&index.to_be_bytes(), format!("test_{index}").as_bytes())
                .unwrap();
        }
    }
    tx.rollback();

    let tx = db.begin(false);
    assert!(matches!(tx.get_bucket(b"test"), Err(Error::BucketNotFound)));
    tx.rollback();
}

#[test]
fn test_rollback_discards_inserts_but_keeps_committed_data() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"test")?;
        bucket.put(b"foo", b"bar")
    })
    .unwrap();

    let tx = db.begin(true);
    {
        let mut bucket = tx.get_bucket(b"test").unwrap();
        for index in 0..5000 {
            let key = format!("test_{index}");
            bucket.put(key.as_bytes(), &u64::from(index as u32).to_be_bytes()).unwrap();
        }
    }
    tx.rollback();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"test")?;
        assert_eq!(bucket.get(b"foo"), Some(b"bar".to_vec()));
        for index in 0..5000 {
            let key = format!("test_{index}");
            assert_eq!(bucket.get(key.as_bytes()), None, "{key} must not survive");
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_drop_without_commit_is_rollback() {
    let (db, _dir, _path) = create_test_db();

    {
        let tx = db.begin(true);
        let mut bucket = tx.create_bucket(b"dropped").unwrap();
        bucket.put(b"k", b"v").unwrap();
        // Tx dropped here without commit.
    }

    db.view(|tx| {
        assert!(matches!(
            tx.get_bucket(b"dropped"),
            Err(Error::BucketNotFound)
        ));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_rollback_returns_allocated_pages() {
    let (db, _dir, _path) = create_test_db();

    // Allocate a pile of pages in a transaction that never commits.
    let before = db.stat();
    let tx = db.begin(true);
    {
        let mut bucket = tx.create_bucket(b"test").unwrap();
        bucket.put(b"blob", &vec![7u8; 40_000]).unwrap();
    }
    tx.rollback();
    let after = db.stat();

    assert!(after.released_pages >= before.released_pages);
}

// ==================== Commit Visibility Tests ====================

#[test]
fn test_sequential_commits_accumulate() {
    let (db, _dir, _path) = create_test_db();

    for index in 0..10 {
        db.update(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(b"seq")?;
            bucket.put(
                format!("key{index}").as_bytes(),
                format!("value{index}").as_bytes(),
            )
        })
        .unwrap();
    }

    db.view(|tx| {
        let bucket = tx.get_bucket(b"seq")?;
        for index in 0..10 {
            assert_eq!(
                bucket.get(format!("key{index}").as_bytes()),
                Some(format!("value{index}").into_bytes())
            );
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_read_tx_commit_is_rollback() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| tx.create_bucket(b"foo").map(|_| ())).unwrap();

    let tx = db.begin(false);
    let bucket = tx.get_bucket(b"foo").unwrap();
    assert_eq!(bucket.get(b"nothing"), None);
    drop(bucket);
    tx.commit().unwrap();

    // The database is still fully usable afterwards.
    db.update(|tx| {
        let mut bucket = tx.get_bucket(b"foo")?;
        bucket.put(b"k", b"v")
    })
    .unwrap();
}

#[test]
fn test_mutations_in_read_tx_are_refused() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"k", b"v")
    })
    .unwrap();

    db.view(|tx| {
        assert!(matches!(tx.create_bucket(b"x"), Err(Error::WriteInReadTx)));
        assert!(matches!(tx.delete_bucket(b"foo"), Err(Error::WriteInReadTx)));
        let mut bucket = tx.get_bucket(b"foo")?;
        assert!(matches!(bucket.put(b"a", b"b"), Err(Error::WriteInReadTx)));
        assert!(matches!(bucket.remove(b"k"), Err(Error::WriteInReadTx)));
        Ok(())
    })
    .unwrap();
}

// ==================== Persistence Tests ====================

#[test]
fn test_data_survives_reopen() {
    let (db, _dir, path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"persist")?;
        for index in 0..1000 {
            bucket.put(
                format!("key_{index:04}").as_bytes(),
                format!("value_{index}").as_bytes(),
            )?;
        }
        Ok(())
    })
    .unwrap();
    db.close().unwrap();

    let db = Database::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        let bucket = tx.get_bucket(b"persist")?;
        for index in 0..1000 {
            assert_eq!(
                bucket.get(format!("key_{index:04}").as_bytes()),
                Some(format!("value_{index}").into_bytes())
            );
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_sequence_survives_reopen() {
    let (db, _dir, path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"counted")?;
        for _ in 0..7 {
            bucket.next_sequence()?;
        }
        Ok(())
    })
    .unwrap();
    db.close().unwrap();

    let db = Database::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        let bucket = tx.get_bucket(b"counted")?;
        assert_eq!(bucket.sequence(), 7);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_deleted_bucket_stays_deleted_after_reopen() {
    let (db, _dir, path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"gone")?;
        bucket.put(b"k", b"v")
    })
    .unwrap();
    db.update(|tx| tx.delete_bucket(b"gone")).unwrap();
    db.close().unwrap();

    let db = Database::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        assert!(matches!(tx.get_bucket(b"gone"), Err(Error::BucketNotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_foreign_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("foreign.db");
    std::fs::write(&path, vec![0x42u8; 64 * 1024]).unwrap();

    let result = Database::open(&path, Options::default());
    assert!(matches!(result, Err(Error::BadDbName)));
}
