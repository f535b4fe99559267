//! Integration tests for the background scanner
//!
//! These run the real scan loop against a temporary root directory.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use subd_cache::ObjectCache;
use subd_core::config::scan_filter_with;
use subd_core::domain::Digest;
use subd_scanner::{RateLimiter, ScanDaemon, ScanSettings, ScannerHandle};
use tempfile::TempDir;

// ============================================================================
// Test helpers
// ============================================================================

struct Fixture {
    root: TempDir,
    cache: ObjectCache,
    handle: ScannerHandle,
}

fn start(interval: Duration) -> Fixture {
    let root = TempDir::new().expect("Failed to create temp dir");
    fs::write(root.path().join("motd"), b"welcome\n").unwrap();
    let cache = ObjectCache::open(root.path().join(".subd/objects")).unwrap();
    let filter = scan_filter_with("/.subd", &[]).unwrap();
    let settings = ScanSettings {
        root: root.path().to_path_buf(),
        interval,
        one_file_system: true,
    };
    let rate = Arc::new(RateLimiter::new("disk", 0, 100));
    let (daemon, handle) = ScanDaemon::new(settings, filter, cache.clone(), rate);
    tokio::spawn(daemon.run());
    Fixture {
        root,
        cache,
        handle,
    }
}

/// Polls until the scan count reaches `count`.
async fn wait_for_scans(handle: &ScannerHandle, count: u64) {
    for _ in 0..200 {
        if handle.snapshot().scan_count >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scanner did not reach {count} scans");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_first_scan_populates_history() {
    let fixture = start(Duration::from_millis(20));
    wait_for_scans(&fixture.handle, 1).await;

    let snapshot = fixture.handle.snapshot();
    assert!(snapshot.has_scanned());
    assert_eq!(snapshot.generation_count, 1);
    let tree = snapshot.tree.unwrap();
    assert!(tree.lookup("/motd").is_some());
    // The private working directory is never part of the tree.
    assert!(tree.lookup("/.subd").is_none());
}

#[tokio::test]
async fn test_generation_moves_only_on_change() {
    let fixture = start(Duration::from_millis(20));
    wait_for_scans(&fixture.handle, 3).await;
    assert_eq!(fixture.handle.snapshot().generation_count, 1);

    fs::write(fixture.root.path().join("motd"), b"changed\n").unwrap();
    let seen = fixture.handle.snapshot().scan_count;
    wait_for_scans(&fixture.handle, seen + 2).await;
    assert_eq!(fixture.handle.snapshot().generation_count, 2);
}

#[tokio::test]
async fn test_disable_stops_scanning_until_enabled() {
    let fixture = start(Duration::from_millis(10));
    wait_for_scans(&fixture.handle, 1).await;

    fixture.handle.disable().await.unwrap();
    assert!(fixture.handle.is_disabled());
    let frozen = fixture.handle.snapshot().scan_count;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.handle.snapshot().scan_count, frozen);

    fixture.handle.enable().await.unwrap();
    wait_for_scans(&fixture.handle, frozen + 1).await;
}

#[tokio::test]
async fn test_pause_guard_re_enables_on_drop() {
    let fixture = start(Duration::from_millis(10));
    wait_for_scans(&fixture.handle, 1).await;

    let pause = fixture.handle.pause().await.unwrap();
    let frozen = fixture.handle.snapshot().scan_count;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.handle.snapshot().scan_count, frozen);
    drop(pause);

    assert!(!fixture.handle.is_disabled());
    wait_for_scans(&fixture.handle, frozen + 1).await;
}

#[tokio::test]
async fn test_overlapping_pauses_hold_until_the_last_is_dropped() {
    let fixture = start(Duration::from_millis(10));
    wait_for_scans(&fixture.handle, 1).await;

    let long_operation = fixture.handle.pause().await.unwrap();
    let short_operation = fixture.handle.pause().await.unwrap();
    let frozen = fixture.handle.snapshot().scan_count;
    drop(short_operation);

    assert!(fixture.handle.is_disabled());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.handle.snapshot().scan_count, frozen);

    drop(long_operation);
    assert!(!fixture.handle.is_disabled());
    wait_for_scans(&fixture.handle, frozen + 1).await;
}

#[tokio::test]
async fn test_disable_and_enable_are_counted() {
    let fixture = start(Duration::from_millis(10));
    wait_for_scans(&fixture.handle, 1).await;

    fixture.handle.disable().await.unwrap();
    let pause = fixture.handle.pause().await.unwrap();
    fixture.handle.enable().await.unwrap();
    assert!(fixture.handle.is_disabled());

    drop(pause);
    assert!(!fixture.handle.is_disabled());
    // Extra enables never go below zero holds.
    fixture.handle.enable().await.unwrap();
    let pause = fixture.handle.pause().await.unwrap();
    assert!(fixture.handle.is_disabled());
    drop(pause);
    assert!(!fixture.handle.is_disabled());
}

#[tokio::test]
async fn test_abandoned_pause_releases_its_hold() {
    let fixture = start(Duration::from_millis(10));
    wait_for_scans(&fixture.handle, 1).await;

    // Abandoned while waiting for the loop to acknowledge.
    let abandoned = tokio::time::timeout(Duration::ZERO, fixture.handle.pause()).await;
    drop(abandoned);

    assert!(!fixture.handle.is_disabled());
    let seen = fixture.handle.snapshot().scan_count;
    wait_for_scans(&fixture.handle, seen + 1).await;
}

#[tokio::test]
async fn test_periodic_scan_reclaims_leftovers_but_not_while_paused() {
    let fixture = start(Duration::from_millis(10));
    wait_for_scans(&fixture.handle, 1).await;

    let digest = Digest::of(b"payload");
    fixture.cache.put(&digest, 7, &b"payload"[..]).unwrap();
    let pause = fixture.handle.pause().await.unwrap();
    fixture.cache.make_copies(&digest, 2).unwrap();
    let copy = fixture.cache.copy_path(&digest, 1);
    fixture.handle.rescan_object_cache().await.unwrap();
    assert!(copy.exists());

    drop(pause);
    let seen = fixture.handle.snapshot().scan_count;
    wait_for_scans(&fixture.handle, seen + 1).await;
    assert!(!copy.exists());
    assert!(fixture.cache.has(&digest));
}

#[tokio::test]
async fn test_rescan_object_cache_moves_generation() {
    let fixture = start(Duration::from_secs(3600));
    wait_for_scans(&fixture.handle, 1).await;
    assert_eq!(fixture.handle.snapshot().generation_count, 1);

    let digest = Digest::of(b"payload");
    fixture.cache.put(&digest, 7, &b"payload"[..]).unwrap();
    assert!(fixture.handle.rescan_object_cache().await.unwrap());

    let snapshot = fixture.handle.snapshot();
    assert_eq!(snapshot.generation_count, 2);
    assert_eq!(snapshot.object_cache.size_of(&digest), Some(7));
    assert_eq!(snapshot.scan_count, 1);

    assert!(!fixture.handle.rescan_object_cache().await.unwrap());
}

#[tokio::test]
async fn test_set_filter_applies_to_next_scan() {
    let fixture = start(Duration::from_millis(10));
    wait_for_scans(&fixture.handle, 1).await;

    fixture
        .handle
        .set_filter(scan_filter_with("/.subd", &["/motd".to_string()]).unwrap());
    let seen = fixture.handle.snapshot().scan_count;
    wait_for_scans(&fixture.handle, seen + 2).await;
    let tree = fixture.handle.snapshot().tree.unwrap();
    assert!(tree.lookup("/motd").is_none());
}
