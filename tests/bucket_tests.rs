//! Summary: Bucket operation tests over a real database file.
//! Copyright (c) YOAB. All rights reserved.

use pirin::{Database, Error, Options};
use rand::Rng;
use tempfile::TempDir;

fn create_test_db() -> (Database, TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.db");
    let db = Database::open(&path, Options::default()).expect("open");
    (db, dir, path)
}

// ==================== Basic Put/Get Tests ====================

#[test]
fn test_create_put_get() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"a", b"1")?;
        bucket.put(b"b", b"2")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(bucket.get(b"b"), Some(b"2".to_vec()));

        let mut cursor = bucket.cursor();
        assert_eq!(cursor.first(), Some((b"a".to_vec(), b"1".to_vec())));
        assert_eq!(cursor.next(), Some((b"b".to_vec(), b"2".to_vec())));
        assert_eq!(cursor.next(), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_get_missing_key() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"present", b"yes")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.get(b"absent"), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_put_overwrites_value() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"key", b"old")?;
        bucket.put(b"key", b"new")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.get(b"key"), Some(b"new".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_empty_value() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"key", b"")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.get(b"key"), Some(Vec::new()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_binary_keys_and_values() {
    let (db, _dir, _path) = create_test_db();
    let key = vec![0x00, 0xFF, 0x7F, 0x80, 0x01];
    let value = vec![0xDE, 0xAD, 0xBE, 0xEF];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"bin")?;
        bucket.put(&key, &value)
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"bin")?;
        assert_eq!(bucket.get(&key), Some(value.clone()));
        Ok(())
    })
    .unwrap();
}

// ==================== Size Limit Tests ====================

#[test]
fn test_key_too_large() {
    let (db, _dir, _path) = create_test_db();
    let long_key = vec![b'k'; pirin::MAX_KEY_SIZE];

    let result = db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(&long_key, b"value")
    });
    assert!(matches!(result, Err(Error::KeyTooLarge)));
}

#[test]
fn test_key_just_under_limit() {
    let (db, _dir, _path) = create_test_db();
    let key = vec![b'k'; pirin::MAX_KEY_SIZE - 1];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(&key, b"value")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.get(&key), Some(b"value".to_vec()));
        Ok(())
    })
    .unwrap();
}

// ==================== Remove Tests ====================

#[test]
fn test_insert_remove() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"foo", b"bar")
    })
    .unwrap();

    db.update(|tx| {
        let mut bucket = tx.get_bucket(b"foo")?;
        bucket.remove(b"foo")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.get(b"foo"), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_remove_missing_key() {
    let (db, _dir, _path) = create_test_db();

    let result = db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.remove(b"never-inserted")
    });
    assert!(matches!(result, Err(Error::NodeNotFound)));
}

#[test]
fn test_insert_many_then_remove_half_across_reopen() {
    let (db, _dir, path) = create_test_db();
    let iterations = 50_000usize;

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        for index in 0..iterations {
            let key = format!("test_{index}");
            let value = format!("value_{index}");
            bucket.put(key.as_bytes(), value.as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    db.close().unwrap();

    // Reopen, verify everything, and pick roughly half the keys.
    let db = Database::open(&path, Options::default()).unwrap();
    let mut rng = rand::thread_rng();
    let mut keys_to_remove: Vec<Vec<u8>> = Vec::new();
    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        for index in 0..iterations {
            let key = format!("test_{index}");
            let value = format!("value_{index}");
            assert_eq!(
                bucket.get(key.as_bytes()),
                Some(value.into_bytes()),
                "missing key {key}"
            );
        }
        Ok(())
    })
    .unwrap();
    for index in 0..iterations {
        if rng.gen_bool(0.5) {
            keys_to_remove.push(format!("test_{index}").into_bytes());
        }
    }

    // Delete the chosen keys in chunks of 10,000 per transaction.
    for chunk in keys_to_remove.chunks(10_000) {
        db.update(|tx| {
            let mut bucket = tx.get_bucket(b"foo")?;
            for key in chunk {
                bucket.remove(key)?;
            }
            Ok(())
        })
        .unwrap();
    }
    db.close().unwrap();

    // Reopen once more: removed keys are gone, the rest survive.
    let db = Database::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        for key in &keys_to_remove {
            assert_eq!(bucket.get(key), None);
        }
        Ok(())
    })
    .unwrap();

    let removed: std::collections::HashSet<Vec<u8>> = keys_to_remove.into_iter().collect();
    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        for index in 0..iterations {
            let key = format!("test_{index}").into_bytes();
            if !removed.contains(&key) {
                let value = format!("value_{index}");
                assert_eq!(bucket.get(&key), Some(value.into_bytes()));
            }
        }
        Ok(())
    })
    .unwrap();
}

// ==================== Blob Tests ====================

#[test]
fn test_blob_round_trip() {
    let (db, _dir, _path) = create_test_db();
    let mut rng = rand::thread_rng();
    let mut value = vec![0u8; 15_012];
    rng.fill(&mut value[..]);

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"foo", &value)
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.get(b"foo"), Some(value.clone()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_blob_survives_reopen() {
    let (db, _dir, path) = create_test_db();
    let value = vec![0xA5u8; 100_000];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"big")?;
        bucket.put(b"key", &value)
    })
    .unwrap();
    db.close().unwrap();

    let db = Database::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        let bucket = tx.get_bucket(b"big")?;
        assert_eq!(bucket.get(b"key"), Some(value.clone()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_blob_remove_releases_pages() {
    let (db, _dir, _path) = create_test_db();
    let value = vec![0x5Au8; 50_000];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"big")?;
        bucket.put(b"key", &value)
    })
    .unwrap();
    let before = db.stat();

    db.update(|tx| {
        let mut bucket = tx.get_bucket(b"big")?;
        bucket.remove(b"key")
    })
    .unwrap();
    let after = db.stat();

    // The whole chain went back to the freelist.
    assert!(after.released_pages > before.released_pages);
    assert!(after.released_pages as usize >= 50_000 / pirin::PAGE_SIZE);

    db.view(|tx| {
        let bucket = tx.get_bucket(b"big")?;
        assert_eq!(bucket.get(b"key"), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_blob_stats() {
    let (db, _dir, _path) = create_test_db();
    let value = vec![1u8; 5_000];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        bucket.put(b"small", b"xy")?;
        bucket.put(b"large", &value)
    })
    .unwrap();

    let stat = db.stat();
    let foo = stat.buckets.get(&b"foo"[..].to_vec()).expect("foo stat");
    assert_eq!(foo.items_n, 2);
    assert_eq!(foo.blobs_n, 1);
    assert_eq!(foo.bytes_in_use, (5 + 2 + 5 + 5_000) as u64);
}

// ==================== Bucket Management Tests ====================

#[test]
fn test_create_bucket_twice_fails() {
    let (db, _dir, _path) = create_test_db();

    let result = db.update(|tx| {
        tx.create_bucket(b"dup")?;
        tx.create_bucket(b"dup").map(|_| ())
    });
    assert!(matches!(result, Err(Error::BucketExists)));
}

#[test]
fn test_create_bucket_if_not_exists() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket_if_not_exists(b"foo")?;
        bucket.put(b"k", b"v")
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.create_bucket_if_not_exists(b"foo")?;
        assert_eq!(bucket.get(b"k"), Some(b"v".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_get_bucket_not_found() {
    let (db, _dir, _path) = create_test_db();

    db.view(|tx| {
        assert!(matches!(tx.get_bucket(b"ghost"), Err(Error::BucketNotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_bucket() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"doomed")?;
        bucket.put(b"k", b"v")
    })
    .unwrap();

    db.update(|tx| tx.delete_bucket(b"doomed")).unwrap();

    db.view(|tx| {
        assert!(matches!(
            tx.get_bucket(b"doomed"),
            Err(Error::BucketNotFound)
        ));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_thousand_buckets_listed_in_order() {
    let (db, _dir, _path) = create_test_db();
    let count = 1000;

    let expected: Vec<Vec<u8>> = (0..count)
        .map(|index| format!("bucket_{index:03}").into_bytes())
        .collect();

    db.update(|tx| {
        for name in &expected {
            tx.create_bucket(name)?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert_eq!(tx.buckets(), expected);
        Ok(())
    })
    .unwrap();
}

// ==================== ForEach and Sequence Tests ====================

#[test]
fn test_for_each_visits_all_in_order() {
    let (db, _dir, _path) = create_test_db();
    let iterations = 10_000;

    let expected: Vec<Vec<u8>> = (0..iterations)
        .map(|index| format!("test_{index:04}").into_bytes())
        .collect();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        for (index, key) in expected.iter().enumerate() {
            bucket.put(key, format!("value_{index}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        let mut keys = Vec::new();
        bucket.for_each(|key, _value| {
            keys.push(key.to_vec());
            Ok(())
        })?;
        assert_eq!(keys, expected);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_next_sequence() {
    let (db, _dir, _path) = create_test_db();
    let iterations = 100u64;

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"foo")?;
        for _ in 0..iterations {
            let sequence = bucket.next_sequence()?;
            bucket.put(
                &sequence.to_be_bytes(),
                format!("value_{sequence}").as_bytes(),
            )?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.get_bucket(b"foo")?;
        assert_eq!(bucket.sequence(), iterations);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_next_sequence_requires_write_tx() {
    let (db, _dir, _path) = create_test_db();

    db.update(|tx| tx.create_bucket(b"foo").map(|_| ())).unwrap();

    db.view(|tx| {
        let mut bucket = tx.get_bucket(b"foo")?;
        assert!(matches!(
            bucket.next_sequence(),
            Err(Error::WriteInReadTx)
        ));
        Ok(())
    })
    .unwrap();
}
