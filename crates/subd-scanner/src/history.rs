//! Scan history and the generation counter
//!
//! The history keeps the latest scanned tree and object cache state. The
//! generation count only moves when a scan produces something structurally
//! different from the previous one, so a coordinator holding generation N
//! can skip downloading an unchanged tree.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use subd_core::domain::{FileSystemTree, ObjectCacheState};
use tracing::debug;

#[derive(Debug, Default)]
pub struct FileSystemHistory {
    tree: Option<Arc<FileSystemTree>>,
    object_cache: Arc<ObjectCacheState>,
    generation_count: u64,
    scan_count: u64,
    last_scan_at: Option<DateTime<Utc>>,
    last_change_at: Option<DateTime<Utc>>,
    last_scan_duration: Option<Duration>,
}

/// Point-in-time copy of the history for a poll response.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub tree: Option<Arc<FileSystemTree>>,
    pub object_cache: Arc<ObjectCacheState>,
    pub generation_count: u64,
    pub scan_count: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_scan_duration: Option<Duration>,
}

impl HistorySnapshot {
    /// True once at least one scan has completed.
    pub fn has_scanned(&self) -> bool {
        self.tree.is_some()
    }
}

impl FileSystemHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed scan. Returns true if the generation moved.
    pub fn update(&mut self, tree: FileSystemTree, object_cache: ObjectCacheState) -> bool {
        self.update_at(tree, object_cache, None, Utc::now())
    }

    /// Records a completed scan along with how long it took.
    pub fn update_timed(
        &mut self,
        tree: FileSystemTree,
        object_cache: ObjectCacheState,
        duration: Duration,
    ) -> bool {
        self.update_at(tree, object_cache, Some(duration), Utc::now())
    }

    fn update_at(
        &mut self,
        tree: FileSystemTree,
        object_cache: ObjectCacheState,
        duration: Option<Duration>,
        now: DateTime<Utc>,
    ) -> bool {
        self.scan_count += 1;
        self.last_scan_at = Some(now);
        if duration.is_some() {
            self.last_scan_duration = duration;
        }
        let changed = match &self.tree {
            None => true,
            Some(previous) => **previous != tree || *self.object_cache != object_cache,
        };
        if changed {
            self.generation_count += 1;
            self.last_change_at = Some(now);
            debug!(
                generation = self.generation_count,
                paths = tree.path_count(),
                objects = object_cache.len(),
                "Filesystem generation changed"
            );
        }
        self.tree = Some(Arc::new(tree));
        self.object_cache = Arc::new(object_cache);
        changed
    }

    /// Replaces the object cache state without a filesystem scan.
    pub fn update_object_cache_only(&mut self, object_cache: ObjectCacheState) -> bool {
        if *self.object_cache == object_cache {
            return false;
        }
        self.generation_count += 1;
        self.last_change_at = Some(Utc::now());
        self.object_cache = Arc::new(object_cache);
        debug!(
            generation = self.generation_count,
            "Object cache changed"
        );
        true
    }

    pub fn tree(&self) -> Option<&Arc<FileSystemTree>> {
        self.tree.as_ref()
    }

    pub fn object_cache(&self) -> &Arc<ObjectCacheState> {
        &self.object_cache
    }

    pub fn generation_count(&self) -> u64 {
        self.generation_count
    }

    pub fn scan_count(&self) -> u64 {
        self.scan_count
    }

    pub fn last_scan_at(&self) -> Option<DateTime<Utc>> {
        self.last_scan_at
    }

    pub fn last_change_at(&self) -> Option<DateTime<Utc>> {
        self.last_change_at
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            tree: self.tree.clone(),
            object_cache: Arc::clone(&self.object_cache),
            generation_count: self.generation_count,
            scan_count: self.scan_count,
            last_scan_at: self.last_scan_at,
            last_change_at: self.last_change_at,
            last_scan_duration: self.last_scan_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use subd_core::domain::{Digest, Inode, Mtime, RegularInode, TreeBuilder, S_IFREG};

    use super::*;

    fn tree_with(content: &[u8]) -> FileSystemTree {
        let mut builder = TreeBuilder::new(TreeBuilder::default_root(0, 0));
        builder
            .insert(
                "/file",
                Inode::Regular(RegularInode {
                    mode: S_IFREG | 0o644,
                    uid: 0,
                    gid: 0,
                    mtime: Mtime::new(1, 0),
                    size: content.len() as u64,
                    digest: Digest::of(content),
                }),
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_first_scan_starts_generation_one() {
        let mut history = FileSystemHistory::new();
        assert!(!history.snapshot().has_scanned());
        assert!(history.update(tree_with(b"a"), ObjectCacheState::new()));
        assert_eq!(history.generation_count(), 1);
        assert_eq!(history.scan_count(), 1);
        assert!(history.last_change_at().is_some());
    }

    #[test]
    fn test_unchanged_scan_keeps_generation() {
        let mut history = FileSystemHistory::new();
        history.update(tree_with(b"a"), ObjectCacheState::new());
        assert!(!history.update(tree_with(b"a"), ObjectCacheState::new()));
        assert_eq!(history.generation_count(), 1);
        assert_eq!(history.scan_count(), 2);

        assert!(history.update(tree_with(b"b"), ObjectCacheState::new()));
        assert_eq!(history.generation_count(), 2);
        assert_eq!(history.scan_count(), 3);
    }

    #[test]
    fn test_cache_change_moves_generation() {
        let mut history = FileSystemHistory::new();
        history.update(tree_with(b"a"), ObjectCacheState::new());

        let mut cache = ObjectCacheState::new();
        cache.insert(Digest::of(b"x"), 1);
        assert!(history.update_object_cache_only(cache.clone()));
        assert_eq!(history.generation_count(), 2);
        assert!(!history.update_object_cache_only(cache));
        assert_eq!(history.generation_count(), 2);
        // Only filesystem scans count as scans.
        assert_eq!(history.scan_count(), 1);
    }
}
