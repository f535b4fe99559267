//! Update applier
//!
//! Executes a [`ChangeSet`] against the live filesystem.
//!
//! ## Sequence
//!
//! 1. Copy local files into the object cache and materialise dedup copies
//! 2. Pre-pass: match every touched path against the previous triggers
//!    without changing anything, then stop the matched services
//! 3. Apply pass, in list order: directories, inodes, hardlinks, deletes,
//!    metadata changes. Every touched path is matched against the new
//!    triggers
//! 4. Save the new trigger list and start the matched services
//!
//! Each entry is applied on its own. A failing entry is logged and recorded
//! in the outcome; the remaining entries still run. Regular files, symlinks
//! and device nodes are staged under a sibling name and renamed into place,
//! so a path never holds a half-written entry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use subd_cache::ObjectCache;
use subd_core::domain::{
    is_within, resolve_under_root, save_triggers, ChangeSet, Digest, FileToCopy, Hardlink, Inode,
    NamedInode, Trigger, TriggerAction, TriggerSet,
};
use subd_core::ports::IServiceRunner;
use tracing::{debug, info, instrument, warn};

use crate::error::ApplyError;
use crate::fsops;

/// Result of one update.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Message of the last entry that failed
    pub last_error: Option<String>,
    pub error_count: usize,
    /// A stop or start action failed
    pub had_trigger_failures: bool,
    /// Time between the first and last filesystem change
    pub change_window: Duration,
    pub duration: Duration,
}

impl ApplyOutcome {
    pub fn had_failures(&self) -> bool {
        self.error_count > 0
    }
}

/// Applies change sets below a managed root.
#[derive(Debug, Clone)]
pub struct UpdateApplier {
    root: PathBuf,
    /// Managed pathname of the private working directory
    work_dir: String,
    cache: ObjectCache,
    triggers_file: PathBuf,
}

impl UpdateApplier {
    pub fn new(
        root: impl Into<PathBuf>,
        work_dir: impl Into<String>,
        cache: ObjectCache,
        triggers_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            work_dir: work_dir.into(),
            cache,
            triggers_file: triggers_file.into(),
        }
    }

    pub fn triggers_file(&self) -> &Path {
        &self.triggers_file
    }

    /// Applies `change_set`. `previous_triggers` are the triggers saved by
    /// the last update.
    #[instrument(skip_all, fields(image = %change_set.image_name))]
    pub async fn apply(
        &self,
        change_set: ChangeSet,
        previous_triggers: &[Trigger],
        runner: &dyn IServiceRunner,
    ) -> ApplyOutcome {
        let started = Instant::now();
        let mut errors = ErrorLog::default();

        let old_triggers = TriggerSet::new(previous_triggers.to_vec()).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unusable previous triggers");
            TriggerSet::default()
        });
        let new_triggers = TriggerSet::new(change_set.triggers.clone()).unwrap_or_else(|e| {
            errors.record(ApplyError::from(e));
            TriggerSet::default()
        });
        let mut run = UpdateRun {
            applier: self.clone(),
            uses: change_set.multiply_used_objects.clone(),
            change_set,
            old_triggers,
            new_triggers,
            errors,
            created: HashSet::new(),
            change_window: Duration::ZERO,
        };

        run = match blocking(run, UpdateRun::prepare).await {
            Ok(run) => run,
            Err(e) => return failed_outcome(e, started),
        };
        let mut had_trigger_failures = false;
        let matched_old = run.old_triggers.matched_triggers();
        if !matched_old.is_empty() {
            had_trigger_failures |= runner.run(&matched_old, TriggerAction::Stop).await;
        }

        run = match blocking(run, UpdateRun::apply_pass).await {
            Ok(run) => run,
            Err(e) => return failed_outcome(e, started),
        };
        let matched_new = run.new_triggers.matched_triggers();
        if !matched_new.is_empty() {
            had_trigger_failures |= runner.run(&matched_new, TriggerAction::Start).await;
        }

        let outcome = ApplyOutcome {
            last_error: run.errors.last,
            error_count: run.errors.count,
            had_trigger_failures,
            change_window: run.change_window,
            duration: started.elapsed(),
        };
        match &outcome.last_error {
            Some(error) => warn!(
                errors = outcome.error_count,
                last_error = %error,
                elapsed_ms = outcome.duration.as_millis() as u64,
                "Update completed with errors"
            ),
            None => info!(
                elapsed_ms = outcome.duration.as_millis() as u64,
                change_window_ms = outcome.change_window.as_millis() as u64,
                "Update completed"
            ),
        }
        outcome
    }

    fn host_path(&self, path: &str) -> Result<PathBuf, ApplyError> {
        Ok(resolve_under_root(&self.root, path)?)
    }

    /// The private working directory is never a creation or deletion target.
    fn skip_path(&self, path: &str) -> bool {
        is_within(path, &self.work_dir)
    }

    /// `path` is a proper ancestor of the private working directory.
    fn encloses_work_dir(&self, path: &str) -> bool {
        path != self.work_dir && is_within(&self.work_dir, path)
    }

    /// Fails if installing a new entry at `path` would remove the private
    /// working directory.
    fn check_replaceable(&self, path: &str) -> Result<(), ApplyError> {
        if self.encloses_work_dir(path) {
            return Err(ApplyError::EnclosesWorkDir(path.to_string()));
        }
        Ok(())
    }
}

async fn blocking(
    run: UpdateRun,
    step: fn(&mut UpdateRun),
) -> Result<UpdateRun, ApplyError> {
    tokio::task::spawn_blocking(move || {
        let mut run = run;
        step(&mut run);
        run
    })
    .await
    .map_err(|e| ApplyError::Task(e.to_string()))
}

fn failed_outcome(error: ApplyError, started: Instant) -> ApplyOutcome {
    warn!(error = %error, "Update aborted");
    ApplyOutcome {
        last_error: Some(error.to_string()),
        error_count: 1,
        duration: started.elapsed(),
        ..ApplyOutcome::default()
    }
}

#[derive(Debug, Default)]
struct ErrorLog {
    last: Option<String>,
    count: usize,
}

impl ErrorLog {
    fn record(&mut self, error: ApplyError) {
        warn!(error = %error, "Update entry failed");
        self.last = Some(error.to_string());
        self.count += 1;
    }
}

/// State carried across the blocking stages of one update.
struct UpdateRun {
    applier: UpdateApplier,
    change_set: ChangeSet,
    /// Pending creations per multiply used object
    uses: BTreeMap<Digest, u64>,
    old_triggers: TriggerSet,
    new_triggers: TriggerSet,
    errors: ErrorLog,
    /// Paths created by this update
    created: HashSet<String>,
    change_window: Duration,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Match triggers only
    Match,
    Apply,
}

impl UpdateRun {
    fn prepare(&mut self) {
        for file in std::mem::take(&mut self.change_set.files_to_copy_to_cache) {
            if let Err(e) = self.copy_to_cache(&file) {
                self.errors.record(e);
            }
        }
        for (digest, uses) in &self.change_set.multiply_used_objects {
            if let Err(e) = self.applier.cache.make_copies(digest, *uses) {
                self.errors.record(e.into());
            }
        }
        if !self.old_triggers.is_empty() {
            self.run_pass(Pass::Match);
            let (matched, total) = self.old_triggers.match_statistics();
            debug!(matched, total, "Previous triggers matched");
        }
    }

    fn apply_pass(&mut self) {
        let started = Instant::now();
        self.run_pass(Pass::Apply);
        self.change_window = started.elapsed();
        if let Err(e) = save_triggers(&self.applier.triggers_file, &self.change_set.triggers) {
            warn!(error = %e, "Failed to save triggers");
        }
    }

    fn copy_to_cache(&self, file: &FileToCopy) -> Result<(), ApplyError> {
        let source = self.applier.host_path(&file.name)?;
        if file.do_hardlink {
            if let Some(size) = self.applier.cache.link_in(&source, &file.digest)? {
                debug!(path = %file.name, size, "Hardlinked file into object cache");
                return Ok(());
            }
        }
        let size = self.applier.cache.copy_in(&source, &file.digest)?;
        debug!(path = %file.name, size, "Copied file into object cache");
        Ok(())
    }

    fn run_pass(&mut self, pass: Pass) {
        let change_set = std::mem::take(&mut self.change_set);
        for dir in &change_set.directories_to_make {
            self.step(pass, &dir.name, |run| run.make_directory(dir));
        }
        for inode in &change_set.inodes_to_make {
            self.step(pass, &inode.name, |run| run.make_inode(inode));
        }
        for link in &change_set.hardlinks_to_make {
            self.step(pass, &link.new_link, |run| run.make_hardlink(link));
        }
        for path in &change_set.paths_to_delete {
            if pass == Pass::Apply && self.created.contains(path) {
                // Replaced by a new entry of another type.
                self.triggers(pass).match_path(path);
                continue;
            }
            self.step(pass, path, |run| run.delete(path));
        }
        for inode in &change_set.inodes_to_change {
            self.step(pass, &inode.name, |run| run.change_inode(inode));
        }
        self.change_set = change_set;
    }

    fn triggers(&mut self, pass: Pass) -> &mut TriggerSet {
        match pass {
            Pass::Match => &mut self.old_triggers,
            Pass::Apply => &mut self.new_triggers,
        }
    }

    fn step<F>(&mut self, pass: Pass, path: &str, action: F)
    where
        F: FnOnce(&mut Self) -> Result<(), ApplyError>,
    {
        if self.applier.skip_path(path) {
            return;
        }
        self.triggers(pass).match_path(path);
        if pass == Pass::Match {
            return;
        }
        if let Err(e) = action(self) {
            self.errors.record(e);
        }
    }

    fn make_directory(&mut self, entry: &NamedInode) -> Result<(), ApplyError> {
        let Inode::Directory(dir) = &entry.inode else {
            return Err(ApplyError::WrongInodeKind {
                path: entry.name.clone(),
                kind: entry.inode.kind(),
            });
        };
        let host = self.applier.host_path(&entry.name)?;
        fsops::make_directory(&host, dir).map_err(|e| ApplyError::io(&host, e))?;
        self.created.insert(entry.name.clone());
        debug!(path = %entry.name, mode = format_args!("{:o}", dir.mode), "Made directory");
        Ok(())
    }

    fn make_inode(&mut self, entry: &NamedInode) -> Result<(), ApplyError> {
        self.applier.check_replaceable(&entry.name)?;
        let host = self.applier.host_path(&entry.name)?;
        match &entry.inode {
            Inode::Regular(regular) => {
                let staged = match regular.size {
                    0 => {
                        let staged = fsops::staging_path(&host, "empty");
                        fsops::create_empty(&staged).map_err(|e| ApplyError::io(&staged, e))?;
                        staged
                    }
                    _ => self.consume_object(&regular.digest),
                };
                self.install(&staged, &host)?;
            }
            Inode::Symlink(symlink) => {
                let staged = fsops::staging_path(&host, "symlink");
                fsops::force_remove_all(&staged).map_err(|e| ApplyError::io(&staged, e))?;
                std::os::unix::fs::symlink(&symlink.target, &staged)
                    .map_err(|e| ApplyError::io(&staged, e))?;
                self.install(&staged, &host)?;
            }
            Inode::Special(special) => {
                let staged = fsops::staging_path(&host, "special");
                fsops::force_remove_all(&staged).map_err(|e| ApplyError::io(&staged, e))?;
                fsops::make_special(&staged, special).map_err(|e| ApplyError::io(&staged, e))?;
                self.install(&staged, &host)?;
            }
            Inode::Directory(_) => {
                return Err(ApplyError::WrongInodeKind {
                    path: entry.name.clone(),
                    kind: entry.inode.kind(),
                })
            }
        }
        // Counts as created even if the metadata write below fails.
        self.created.insert(entry.name.clone());
        fsops::write_metadata(&host, &entry.inode).map_err(|e| ApplyError::io(&host, e))?;
        debug!(path = %entry.name, kind = %entry.inode.kind(), "Made inode");
        Ok(())
    }

    /// Picks the physical cache file the next creation of `digest` renames
    /// away: the highest numbered dedup copy first, the object itself last.
    fn consume_object(&mut self, digest: &Digest) -> PathBuf {
        let remaining = self.uses.get(digest).copied().unwrap_or(1);
        let path = self.applier.cache.consumable_path(digest, remaining);
        if remaining > 1 {
            self.uses.insert(*digest, remaining - 1);
        } else {
            self.uses.remove(digest);
        }
        path
    }

    fn install(&self, staged: &Path, host: &Path) -> Result<(), ApplyError> {
        fsops::force_rename(staged, host).map_err(|e| {
            if staged.exists() && !staged.starts_with(self.applier.cache.dir()) {
                let _ = fsops::force_remove_all(staged);
            }
            ApplyError::io(host, e)
        })
    }

    fn make_hardlink(&mut self, link: &Hardlink) -> Result<(), ApplyError> {
        self.applier.check_replaceable(&link.new_link)?;
        let target = self.applier.host_path(&link.target)?;
        let host = self.applier.host_path(&link.new_link)?;
        let staged = fsops::staging_path(&host, "link");
        fsops::force_remove_all(&staged).map_err(|e| ApplyError::io(&staged, e))?;
        std::fs::hard_link(&target, &staged).map_err(|e| ApplyError::io(&target, e))?;
        self.install(&staged, &host)?;
        self.created.insert(link.new_link.clone());
        debug!(path = %link.new_link, target = %link.target, "Linked");
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<(), ApplyError> {
        if self.applier.encloses_work_dir(path) {
            warn!(
                path,
                work_dir = %self.applier.work_dir,
                "Not deleting an ancestor of the working directory"
            );
            return Ok(());
        }
        let host = self.applier.host_path(path)?;
        fsops::force_remove_all(&host).map_err(|e| ApplyError::io(&host, e))?;
        debug!(path, "Deleted");
        Ok(())
    }

    fn change_inode(&mut self, entry: &NamedInode) -> Result<(), ApplyError> {
        let host = self.applier.host_path(&entry.name)?;
        fsops::write_metadata(&host, &entry.inode).map_err(|e| ApplyError::io(&host, e))?;
        debug!(path = %entry.name, "Changed inode");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use subd_core::domain::{Mtime, RegularInode, S_IFREG};
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(TriggerAction, Vec<String>)>>,
    }

    #[async_trait]
    impl IServiceRunner for RecordingRunner {
        async fn run(&self, triggers: &[Trigger], action: TriggerAction) -> bool {
            let services = triggers.iter().map(|t| t.service.clone()).collect();
            self.calls.lock().unwrap().push((action, services));
            false
        }
    }

    fn setup() -> (TempDir, UpdateApplier) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join(".subd")).unwrap();
        let cache = ObjectCache::open(root.join(".subd/objects")).unwrap();
        let applier = UpdateApplier::new(&root, "/.subd", cache, root.join(".subd/triggers.json"));
        (tmp, applier)
    }

    fn ids(applier: &UpdateApplier) -> (u32, u32) {
        use std::os::unix::fs::MetadataExt;
        let meta = fs::metadata(&applier.root).unwrap();
        (meta.uid(), meta.gid())
    }

    #[tokio::test]
    async fn test_empty_file_created() {
        let (_tmp, applier) = setup();
        let (uid, gid) = ids(&applier);
        let mut change_set = ChangeSet::new("img");
        change_set.inodes_to_make.push(NamedInode {
            name: "/empty".into(),
            inode: Inode::Regular(RegularInode {
                mode: S_IFREG | 0o644,
                uid,
                gid,
                mtime: Mtime::new(42, 0),
                size: 0,
                digest: Digest::of(b""),
            }),
        });
        let outcome = applier.apply(change_set, &[], &RecordingRunner::default()).await;
        assert!(!outcome.had_failures(), "{:?}", outcome.last_error);
        assert_eq!(fs::read(applier.root.join("empty")).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_work_dir_is_never_touched() {
        let (_tmp, applier) = setup();
        let mut change_set = ChangeSet::new("img");
        change_set.paths_to_delete.push("/.subd".into());
        change_set.paths_to_delete.push("/.subd/objects".into());
        let outcome = applier.apply(change_set, &[], &RecordingRunner::default()).await;
        assert!(!outcome.had_failures());
        assert!(applier.root.join(".subd/objects").is_dir());
    }

    fn nested_setup() -> (TempDir, UpdateApplier) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("var/lib/subd")).unwrap();
        let cache = ObjectCache::open(root.join("var/lib/subd/objects")).unwrap();
        let applier = UpdateApplier::new(
            &root,
            "/var/lib/subd",
            cache,
            root.join("var/lib/subd/triggers.json"),
        );
        (tmp, applier)
    }

    #[tokio::test]
    async fn test_ancestors_of_nested_work_dir_are_not_deleted() {
        let (_tmp, applier) = nested_setup();
        applier.cache.put(&Digest::of(b"kept"), 4, &b"kept"[..]).unwrap();
        fs::write(applier.root.join("var/stale"), b"old").unwrap();

        let mut change_set = ChangeSet::new("img");
        change_set.paths_to_delete.push("/var".into());
        change_set.paths_to_delete.push("/var/lib".into());
        change_set.paths_to_delete.push("/var/stale".into());
        let outcome = applier.apply(change_set, &[], &RecordingRunner::default()).await;

        assert!(!outcome.had_failures(), "{:?}", outcome.last_error);
        assert!(applier.root.join("var/lib/subd/objects").is_dir());
        assert!(applier.cache.has(&Digest::of(b"kept")));
        assert!(!applier.root.join("var/stale").exists());
    }

    #[tokio::test]
    async fn test_ancestor_of_nested_work_dir_is_not_replaced() {
        let (_tmp, applier) = nested_setup();
        let (uid, gid) = ids(&applier);
        let mut change_set = ChangeSet::new("img");
        change_set.inodes_to_make.push(NamedInode {
            name: "/var".into(),
            inode: Inode::Regular(RegularInode {
                mode: S_IFREG | 0o644,
                uid,
                gid,
                mtime: Mtime::new(42, 0),
                size: 0,
                digest: Digest::of(b""),
            }),
        });
        change_set.paths_to_delete.push("/var".into());
        let outcome = applier.apply(change_set, &[], &RecordingRunner::default()).await;

        assert_eq!(outcome.error_count, 1);
        assert!(applier.root.join("var/lib/subd/objects").is_dir());
        assert!(fs::symlink_metadata(applier.root.join("var")).unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_missing_object_is_recorded_and_batch_continues() {
        let (_tmp, applier) = setup();
        let (uid, gid) = ids(&applier);
        let mut change_set = ChangeSet::new("img");
        change_set.inodes_to_make.push(NamedInode {
            name: "/absent".into(),
            inode: Inode::Regular(RegularInode {
                mode: S_IFREG | 0o644,
                uid,
                gid,
                mtime: Mtime::new(42, 0),
                size: 3,
                digest: Digest::of(b"abc"),
            }),
        });
        change_set.paths_to_delete.push("/stale".into());
        fs::write(applier.root.join("stale"), b"old").unwrap();

        let outcome = applier.apply(change_set, &[], &RecordingRunner::default()).await;
        assert_eq!(outcome.error_count, 1);
        assert!(outcome.last_error.is_some());
        assert!(!applier.root.join("stale").exists());
    }

    #[tokio::test]
    async fn test_triggers_saved_after_update() {
        let (_tmp, applier) = setup();
        let mut change_set = ChangeSet::new("img");
        change_set.triggers = vec![Trigger::new("nginx", vec!["/etc/nginx/.*".into()])];
        applier.apply(change_set, &[], &RecordingRunner::default()).await;

        let saved = subd_core::domain::load_triggers(applier.triggers_file()).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].service, "nginx");
    }
}
