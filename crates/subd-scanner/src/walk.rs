//! Filesystem walk
//!
//! Builds a [`FileSystemTree`] of everything below the managed root that the
//! filter does not exclude. Regular files are hashed through the rate
//! limiter; directories, symlinks and device nodes are recorded from their
//! metadata alone. Sockets are skipped.
//!
//! Entries are visited in name order, so two scans of an unchanged tree are
//! structurally equal. Files that disappear between `readdir` and `lstat`
//! are skipped. The cancel check runs between files; a cancelled scan
//! returns [`ScanOutcome::Disabled`], not an error.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, Metadata};
use std::io::{ErrorKind, Read};
use std::ops::ControlFlow;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, Instant};

use sha2::{Digest as _, Sha512};
use subd_core::domain::{
    file_type_bits, join_path, resolve_under_root, Digest, DirectoryInode, FileSystemTree, Filter,
    Inode, Mtime, RegularInode, SpecialInode, SymlinkInode, TreeBuilder, ROOT_PATH, S_IFDIR,
    S_IFLNK, S_IFREG, S_IFSOCK,
};
use tracing::{debug, instrument, warn};

use crate::error::ScanError;
use crate::rate_limit::RateLimiter;

const READ_BUFFER_LEN: usize = 64 * 1024;

/// Walk options beyond the root, filter and limiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Skip entries that live on a different device than the root.
    pub one_file_system: bool,
}

/// A completed scan.
#[derive(Debug)]
pub struct ScanResult {
    pub tree: FileSystemTree,
    /// Regular file content read while hashing
    pub bytes_read: u64,
    pub duration: Duration,
}

#[derive(Debug)]
pub enum ScanOutcome {
    Complete(ScanResult),
    /// The cancel check fired before the walk finished.
    Disabled,
}

/// Scans `root` without crossing device boundaries.
pub fn scan(
    root: &Path,
    filter: &Filter,
    rate: &RateLimiter,
    cancel: &dyn Fn() -> bool,
) -> Result<ScanOutcome, ScanError> {
    scan_with_options(
        root,
        filter,
        rate,
        ScanOptions {
            one_file_system: true,
        },
        cancel,
    )
}

#[instrument(skip(filter, rate, cancel), fields(root = %root.display()))]
pub fn scan_with_options(
    root: &Path,
    filter: &Filter,
    rate: &RateLimiter,
    options: ScanOptions,
    cancel: &dyn Fn() -> bool,
) -> Result<ScanOutcome, ScanError> {
    let started = Instant::now();
    let meta = fs::symlink_metadata(root).map_err(|e| ScanError::io(root, e))?;
    if !meta.is_dir() {
        return Err(ScanError::RootNotDirectory(root.to_path_buf()));
    }
    let root_inode = DirectoryInode {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        entries: Vec::new(),
    };
    let mut walker = Walker {
        root,
        filter,
        rate,
        options,
        cancel,
        device: meta.dev(),
        builder: TreeBuilder::new(root_inode),
        linked_inodes: HashMap::new(),
        directories: HashSet::from([(meta.dev(), meta.ino())]),
        bytes_read: 0,
        buffer: vec![0u8; READ_BUFFER_LEN],
    };
    if walker.scan_directory(ROOT_PATH)?.is_break() {
        debug!("Scan cancelled");
        return Ok(ScanOutcome::Disabled);
    }
    let bytes_read = walker.bytes_read;
    let tree = walker.builder.build();
    let duration = started.elapsed();
    debug!(
        paths = tree.path_count(),
        bytes_read,
        elapsed_ms = duration.as_millis() as u64,
        "Scan complete"
    );
    Ok(ScanOutcome::Complete(ScanResult {
        tree,
        bytes_read,
        duration,
    }))
}

struct Walker<'a> {
    root: &'a Path,
    filter: &'a Filter,
    rate: &'a RateLimiter,
    options: ScanOptions,
    cancel: &'a dyn Fn() -> bool,
    device: u64,
    builder: TreeBuilder,
    /// (device, inode) of multiply-linked non-directories to tree inode numbers
    linked_inodes: HashMap<(u64, u64), u64>,
    directories: HashSet<(u64, u64)>,
    bytes_read: u64,
    buffer: Vec<u8>,
}

impl Walker<'_> {
    fn scan_directory(&mut self, path: &str) -> Result<ControlFlow<()>, ScanError> {
        let host_path = resolve_under_root(self.root, path)?;
        let entries = match fs::read_dir(&host_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound && path != ROOT_PATH => {
                return Ok(ControlFlow::Continue(()))
            }
            Err(e) => return Err(ScanError::io(host_path, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ScanError::io(&host_path, e))?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => warn!(dir = path, ?name, "Skipping non-UTF-8 name"),
            }
        }
        names.sort();

        for name in names {
            if (self.cancel)() {
                return Ok(ControlFlow::Break(()));
            }
            let child = join_path(path, &name);
            if self.filter.matches(&child) {
                continue;
            }
            let host_child = host_path.join(&name);
            let meta = match fs::symlink_metadata(&host_child) {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(ScanError::io(host_child, e)),
            };
            if self.options.one_file_system && meta.dev() != self.device {
                continue;
            }
            let flow = match file_type_bits(meta.mode()) {
                S_IFDIR => self.add_directory(&child, &meta)?,
                S_IFREG => {
                    self.add_regular(&child, &host_child, &meta)?;
                    ControlFlow::Continue(())
                }
                S_IFLNK => {
                    self.add_symlink(&child, &host_child, &meta)?;
                    ControlFlow::Continue(())
                }
                S_IFSOCK => ControlFlow::Continue(()),
                _ => {
                    self.add_special(&child, &meta)?;
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                return Ok(flow);
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn add_directory(&mut self, path: &str, meta: &Metadata) -> Result<ControlFlow<()>, ScanError> {
        if !self.directories.insert((meta.dev(), meta.ino())) {
            return Err(ScanError::HardlinkedDirectory(path.to_string()));
        }
        let inode = Inode::Directory(DirectoryInode {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            entries: Vec::new(),
        });
        self.builder.insert(path, inode)?;
        self.scan_directory(path)
    }

    /// Links `path` to an already-scanned inode. Returns true if it did.
    fn link_existing(&mut self, path: &str, meta: &Metadata) -> Result<bool, ScanError> {
        if meta.nlink() < 2 {
            return Ok(false);
        }
        match self.linked_inodes.get(&(meta.dev(), meta.ino())) {
            Some(&number) => {
                self.builder.link(path, number)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remember(&mut self, meta: &Metadata, number: u64) {
        if meta.nlink() > 1 {
            self.linked_inodes.insert((meta.dev(), meta.ino()), number);
        }
    }

    fn add_regular(&mut self, path: &str, host_path: &Path, meta: &Metadata) -> Result<(), ScanError> {
        if self.link_existing(path, meta)? {
            return Ok(());
        }
        let file = match File::open(host_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ScanError::io(host_path, e)),
        };
        let mut reader = self.rate.reader(file);
        let mut hasher = Sha512::new();
        let mut size = 0u64;
        loop {
            let n = match reader.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ScanError::io(host_path, e)),
            };
            hasher.update(&self.buffer[..n]);
            size += n as u64;
        }
        self.bytes_read += size;
        let inode = Inode::Regular(RegularInode {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: Mtime::new(meta.mtime(), meta.mtime_nsec() as u32),
            size,
            digest: Digest::from_hasher(hasher),
        });
        let number = self.builder.insert(path, inode)?;
        self.remember(meta, number);
        Ok(())
    }

    fn add_symlink(&mut self, path: &str, host_path: &Path, meta: &Metadata) -> Result<(), ScanError> {
        if self.link_existing(path, meta)? {
            return Ok(());
        }
        let target = match fs::read_link(host_path) {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ScanError::io(host_path, e)),
        };
        let Some(target) = target.to_str().map(str::to_owned) else {
            warn!(path, "Skipping symlink with non-UTF-8 target");
            return Ok(());
        };
        let inode = Inode::Symlink(SymlinkInode {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            target,
        });
        let number = self.builder.insert(path, inode)?;
        self.remember(meta, number);
        Ok(())
    }

    fn add_special(&mut self, path: &str, meta: &Metadata) -> Result<(), ScanError> {
        if self.link_existing(path, meta)? {
            return Ok(());
        }
        let inode = Inode::Special(SpecialInode {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: Mtime::new(meta.mtime(), meta.mtime_nsec() as u32),
            rdev: meta.rdev(),
        });
        let number = self.builder.insert(path, inode)?;
        self.remember(meta, number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tempfile::TempDir;

    use super::*;

    fn unlimited() -> RateLimiter {
        RateLimiter::new("test", 0, 100)
    }

    fn complete(outcome: ScanOutcome) -> ScanResult {
        match outcome {
            ScanOutcome::Complete(result) => result,
            ScanOutcome::Disabled => panic!("scan unexpectedly disabled"),
        }
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/hosts"), b"127.0.0.1\n").unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();
        std::os::unix::fs::symlink("/etc/hosts", dir.path().join("link")).unwrap();
        dir
    }

    #[test]
    fn test_scan_builds_tree() {
        let dir = fixture();
        let result = complete(scan(dir.path(), &Filter::default(), &unlimited(), &|| false).unwrap());
        let tree = &result.tree;

        let (_, a) = tree.lookup("/a").unwrap();
        let a = a.as_regular().unwrap();
        assert_eq!(a.size, 5);
        assert_eq!(a.digest, Digest::of(b"hello"));

        let (_, link) = tree.lookup("/link").unwrap();
        assert!(matches!(link, Inode::Symlink(s) if s.target == "/etc/hosts"));
        assert!(tree.lookup("/etc/hosts").is_some());
        assert_eq!(tree.lookup("/empty").unwrap().1.as_regular().unwrap().size, 0);
        assert_eq!(result.bytes_read, 5 + 10);
    }

    #[test]
    fn test_two_scans_are_equal() {
        let dir = fixture();
        let first = complete(scan(dir.path(), &Filter::default(), &unlimited(), &|| false).unwrap());
        let second = complete(scan(dir.path(), &Filter::default(), &unlimited(), &|| false).unwrap());
        assert_eq!(first.tree, second.tree);

        fs::write(dir.path().join("a"), b"hellO").unwrap();
        let third = complete(scan(dir.path(), &Filter::default(), &unlimited(), &|| false).unwrap());
        assert_ne!(first.tree, third.tree);
    }

    #[test]
    fn test_filter_skips_subtree() {
        let dir = fixture();
        let filter = Filter::new(["/etc"]).unwrap();
        let result = complete(scan(dir.path(), &filter, &unlimited(), &|| false).unwrap());
        assert!(result.tree.lookup("/etc").is_none());
        assert!(result.tree.lookup("/etc/hosts").is_none());
        assert!(result.tree.lookup("/a").is_some());
    }

    #[test]
    fn test_hardlinks_share_an_inode() {
        let dir = fixture();
        fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();
        let result = complete(scan(dir.path(), &Filter::default(), &unlimited(), &|| false).unwrap());
        let (a, _) = result.tree.lookup("/a").unwrap();
        let (b, _) = result.tree.lookup("/b").unwrap();
        assert_eq!(a, b);
        assert_eq!(result.tree.paths_of(a), ["/a", "/b"]);
        // Content is hashed once per inode.
        assert_eq!(result.bytes_read, 5 + 10);
    }

    #[test]
    fn test_cancel_returns_disabled() {
        let dir = fixture();
        let calls = Cell::new(0);
        let cancel = || {
            calls.set(calls.get() + 1);
            calls.get() > 2
        };
        let outcome = scan(dir.path(), &Filter::default(), &unlimited(), &cancel).unwrap();
        assert!(matches!(outcome, ScanOutcome::Disabled));
    }

    #[test]
    fn test_root_must_be_directory() {
        let dir = fixture();
        let err = scan(&dir.path().join("a"), &Filter::default(), &unlimited(), &|| false).unwrap_err();
        assert!(matches!(err, ScanError::RootNotDirectory(_)));
    }

    #[test]
    fn test_fifo_is_special() {
        let dir = fixture();
        let fifo = dir.path().join("pipe");
        let c_path = std::ffi::CString::new(fifo.to_str().unwrap()).unwrap();
        // SAFETY: valid NUL-terminated path.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        assert_eq!(rc, 0);
        let result = complete(scan(dir.path(), &Filter::default(), &unlimited(), &|| false).unwrap());
        assert!(matches!(result.tree.lookup("/pipe").unwrap().1, Inode::Special(_)));
    }

    fn escape(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^'
                | '$' | '#' | '&' | '-' | '~' => format!("\\{c}"),
                _ => c.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_one_file_system_stops_at_mount_points() {
        // /dev normally holds other mounts (pts, shm, mqueue).
        let root = Path::new("/dev");
        let Ok(root_meta) = fs::metadata(root) else {
            return;
        };
        let mut names: Vec<String> = match fs::read_dir(root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => return,
        };
        names.sort();
        let mount = names.iter().find(|name| {
            fs::symlink_metadata(root.join(name))
                .map(|m| m.is_dir() && m.dev() != root_meta.dev())
                .unwrap_or(false)
        });
        let Some(mount) = mount else {
            return;
        };

        // Only look at the mount point itself, not at anything inside it.
        let mut lines: Vec<String> = names
            .iter()
            .filter(|name| *name != mount)
            .map(|name| format!("/{}(/|$)", escape(name)))
            .collect();
        lines.push(format!("/{}/", escape(mount)));
        let filter = Filter::new(&lines).unwrap();
        let mount_path = format!("/{mount}");

        let crossing = ScanOptions {
            one_file_system: false,
        };
        let result = complete(scan_with_options(root, &filter, &unlimited(), crossing, &|| false).unwrap());
        assert!(result.tree.lookup(&mount_path).is_some());

        let staying = ScanOptions {
            one_file_system: true,
        };
        let result = complete(scan_with_options(root, &filter, &unlimited(), staying, &|| false).unwrap());
        assert!(result.tree.lookup(&mount_path).is_none());
    }
}
