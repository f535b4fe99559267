//! Integration tests for ObjectCache
//!
//! Each test opens a fresh cache in its own temporary directory.

use std::fs;
use std::io::Read;
use std::sync::Arc;

use subd_cache::{ObjectCache, ObjectCacheError};
use subd_core::domain::Digest;
use tempfile::TempDir;

// ============================================================================
// Test helpers
// ============================================================================

fn setup() -> (TempDir, ObjectCache) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let cache = ObjectCache::open(temp_dir.path().join("objects")).expect("open cache");
    (temp_dir, cache)
}

/// Every file below the cache directory, relative to it
fn all_files(cache: &ObjectCache) -> Vec<String> {
    let mut files = Vec::new();
    for prefix in fs::read_dir(cache.dir()).unwrap() {
        let prefix = prefix.unwrap();
        if prefix.file_type().unwrap().is_dir() {
            for file in fs::read_dir(prefix.path()).unwrap() {
                let file = file.unwrap();
                files.push(format!(
                    "{}/{}",
                    prefix.file_name().to_string_lossy(),
                    file.file_name().to_string_lossy()
                ));
            }
        } else {
            files.push(prefix.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    files
}

// ============================================================================
// put / get / has / remove
// ============================================================================

#[test]
fn test_put_then_get() {
    let (_tmp, cache) = setup();
    let digest = Digest::of(b"hello");
    assert!(!cache.has(&digest));

    cache.put(&digest, 5, &b"hello"[..]).unwrap();
    assert!(cache.has(&digest));
    assert_eq!(cache.size_of(&digest).unwrap(), Some(5));

    let (size, mut reader) = cache.get(&digest).unwrap();
    assert_eq!(size, 5);
    let mut content = String::new();
    reader.read_to_string(&mut content).unwrap();
    assert_eq!(content, "hello");
}

#[test]
fn test_get_missing_object() {
    let (_tmp, cache) = setup();
    let err = cache.get(&Digest::of(b"absent")).unwrap_err();
    assert!(matches!(err, ObjectCacheError::NotFound(_)));
    assert!(err.is_not_found());
}

#[test]
fn test_put_rejects_wrong_content() {
    let (_tmp, cache) = setup();
    let digest = Digest::of(b"hello");
    let err = cache.put(&digest, 5, &b"jello"[..]).unwrap_err();
    assert!(matches!(err, ObjectCacheError::DigestMismatch { .. }));
    assert!(!cache.has(&digest));
    // No digest-named or temporary file survives.
    assert!(all_files(&cache).is_empty());
}

#[test]
fn test_put_rejects_wrong_size() {
    let (_tmp, cache) = setup();
    let digest = Digest::of(b"hello");
    let err = cache.put(&digest, 6, &b"hello"[..]).unwrap_err();
    assert!(matches!(
        err,
        ObjectCacheError::SizeMismatch {
            expected: 6,
            actual: 5,
            ..
        }
    ));
    assert!(!cache.has(&digest));
}

#[test]
fn test_dropped_writer_leaves_nothing() {
    let (_tmp, cache) = setup();
    let digest = Digest::of(b"hello world");
    {
        let mut writer = cache.writer(&digest, 11).unwrap();
        writer.write_chunk(b"hello").unwrap();
        assert_eq!(writer.written(), 5);
        assert_eq!(all_files(&cache).len(), 1, "temporary file present while writing");
    }
    assert!(all_files(&cache).is_empty());
    assert!(!cache.has(&digest));
}

#[test]
fn test_streaming_writer_commit() {
    let (_tmp, cache) = setup();
    let digest = Digest::of(b"hello world");
    let mut writer = cache.writer(&digest, 11).unwrap();
    writer.write_chunk(b"hello").unwrap();
    writer.write_chunk(b" world").unwrap();
    assert_eq!(writer.commit().unwrap(), 11);
    assert_eq!(all_files(&cache).len(), 1);
    assert!(cache.has(&digest));
}

#[test]
fn test_concurrent_puts_of_same_digest() {
    let (_tmp, cache) = setup();
    let cache = Arc::new(cache);
    let content = vec![7u8; 256 * 1024];
    let digest = Digest::of(&content);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let content = content.clone();
            std::thread::spawn(move || cache.put(&digest, content.len() as u64, &content[..]))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let (size, mut reader) = cache.get(&digest).unwrap();
    assert_eq!(size, content.len() as u64);
    let mut stored = Vec::new();
    reader.read_to_end(&mut stored).unwrap();
    assert_eq!(stored, content);
    assert_eq!(all_files(&cache).len(), 1);
}

#[test]
fn test_remove() {
    let (_tmp, cache) = setup();
    let digest = Digest::of(b"bye");
    cache.put(&digest, 3, &b"bye"[..]).unwrap();
    assert!(cache.remove(&digest).unwrap());
    assert!(!cache.has(&digest));
    assert!(!cache.remove(&digest).unwrap());
}

#[test]
fn test_copy_in_from_local_file() {
    let (tmp, cache) = setup();
    let source = tmp.path().join("etc-hosts");
    fs::write(&source, b"127.0.0.1 localhost\n").unwrap();
    let digest = Digest::of(b"127.0.0.1 localhost\n");

    assert_eq!(cache.copy_in(&source, &digest).unwrap(), 20);
    assert!(cache.has(&digest));

    let wrong = Digest::of(b"something else");
    assert!(cache.copy_in(&source, &wrong).is_err());
}

#[test]
fn test_link_in_shares_the_inode() {
    use std::os::unix::fs::MetadataExt;

    let (tmp, cache) = setup();
    let source = tmp.path().join("moved");
    fs::write(&source, b"moved content").unwrap();
    let digest = Digest::of(b"moved content");

    assert_eq!(cache.link_in(&source, &digest).unwrap(), Some(13));
    assert_eq!(
        fs::metadata(&source).unwrap().ino(),
        fs::metadata(cache.object_path(&digest)).unwrap().ino()
    );
    assert_eq!(all_files(&cache).len(), 1);
    assert!(cache.scan().unwrap().contains(&digest));
}

#[test]
fn test_link_in_declines_files_with_other_names() {
    let (tmp, cache) = setup();
    let source = tmp.path().join("one");
    fs::write(&source, b"aliased").unwrap();
    fs::hard_link(&source, tmp.path().join("two")).unwrap();
    let digest = Digest::of(b"aliased");

    assert_eq!(cache.link_in(&source, &digest).unwrap(), None);
    assert!(!cache.has(&digest));
}

// ============================================================================
// Dedup copies
// ============================================================================

#[test]
fn test_make_copies_for_three_uses() {
    let (_tmp, cache) = setup();
    let digest = Digest::of(b"shared");
    cache.put(&digest, 6, &b"shared"[..]).unwrap();

    cache.make_copies(&digest, 3).unwrap();
    assert!(cache.copy_path(&digest, 1).is_file());
    assert!(cache.copy_path(&digest, 2).is_file());
    assert!(!cache.copy_path(&digest, 3).exists());
    assert_eq!(fs::read(cache.copy_path(&digest, 2)).unwrap(), b"shared");

    // Copies are not objects.
    let state = cache.scan().unwrap();
    assert_eq!(state.len(), 1);
}

#[test]
fn test_make_copies_of_missing_object() {
    let (_tmp, cache) = setup();
    let err = cache.make_copies(&Digest::of(b"nope"), 2).unwrap_err();
    assert!(matches!(err, ObjectCacheError::NotFound(_)));
}

// ============================================================================
// scan
// ============================================================================

#[test]
fn test_scan_reports_objects_and_cleans_garbage() {
    let (_tmp, cache) = setup();
    let hello = Digest::of(b"hello");
    let hi = Digest::of(b"hi");
    cache.put(&hello, 5, &b"hello"[..]).unwrap();
    cache.put(&hi, 2, &b"hi"[..]).unwrap();

    let hex = hello.to_hex();
    let prefix_dir = cache.dir().join(&hex[..2]);
    fs::write(prefix_dir.join("not-a-digest"), b"junk").unwrap();
    fs::write(prefix_dir.join(format!("{}.abc^", &hex[2..])), b"hel").unwrap();
    fs::write(prefix_dir.join(format!("{}~1~", &hex[2..])), b"hello").unwrap();
    fs::write(cache.dir().join("README"), b"junk").unwrap();
    fs::create_dir(cache.dir().join("zz")).unwrap();

    let state = cache.scan().unwrap();
    assert_eq!(state.len(), 2);
    assert_eq!(state.size_of(&hello), Some(5));
    assert_eq!(state.size_of(&hi), Some(2));

    assert!(!prefix_dir.join("not-a-digest").exists());
    assert!(!cache.dir().join("README").exists());
    assert!(!cache.dir().join("zz").exists());
    assert!(prefix_dir.join(format!("{}.abc^", &hex[2..])).exists());
    assert!(prefix_dir.join(format!("{}~1~", &hex[2..])).exists());
}

#[test]
fn test_reclaiming_scan_removes_leftover_insertions_and_copies() {
    let (_tmp, cache) = setup();
    let hello = Digest::of(b"hello");
    cache.put(&hello, 5, &b"hello"[..]).unwrap();
    cache.make_copies(&hello, 3).unwrap();
    let hex = hello.to_hex();
    let prefix_dir = cache.dir().join(&hex[..2]);
    let leftover = prefix_dir.join(format!("{}.abc^", &hex[2..]));
    fs::write(&leftover, b"hel").unwrap();

    let state = cache.scan_and_reclaim().unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state.size_of(&hello), Some(5));
    assert!(cache.has(&hello));
    assert!(!leftover.exists());
    assert!(!cache.copy_path(&hello, 1).exists());
    assert!(!cache.copy_path(&hello, 2).exists());
    assert_eq!(fs::read_dir(&prefix_dir).unwrap().count(), 1);
}

#[test]
fn test_scan_empty_cache() {
    let (_tmp, cache) = setup();
    assert!(cache.scan().unwrap().is_empty());
}
