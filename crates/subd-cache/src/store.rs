//! On-disk object cache.

use std::fs::{self, DirBuilder, File};
use std::io::Read;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use subd_core::domain::{Digest, ObjectCacheState, DIGEST_LEN};
use tracing::{debug, info, warn};

use crate::error::ObjectCacheError;
use crate::writer::ObjectWriter;

const COPY_BUFFER_LEN: usize = 64 * 1024;

/// Content-addressed blob directory keyed by digest.
#[derive(Debug, Clone)]
pub struct ObjectCache {
    dir: PathBuf,
}

impl ObjectCache {
    /// Opens the cache at `dir`, creating it (mode 0700) if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ObjectCacheError> {
        let dir = dir.into();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| ObjectCacheError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the object named by `digest`.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        let (prefix, rest) = hex.split_at(2);
        self.dir.join(prefix).join(rest)
    }

    /// Path of the `k`-th dedup copy of an object.
    pub fn copy_path(&self, digest: &Digest, k: u64) -> PathBuf {
        let mut name = self.object_path(digest).into_os_string();
        name.push(format!("~{k}~"));
        PathBuf::from(name)
    }

    /// Reverses [`ObjectCache::object_path`] for a `prefix/rest` pair.
    pub fn digest_from_names(prefix: &str, rest: &str) -> Option<Digest> {
        if prefix.len() != 2 || rest.len() != DIGEST_LEN * 2 - 2 {
            return None;
        }
        if !is_lower_hex(prefix) || !is_lower_hex(rest) {
            return None;
        }
        format!("{prefix}{rest}").parse().ok()
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    /// Size of a cached object, or `None` if absent.
    pub fn size_of(&self, digest: &Digest) -> Result<Option<u64>, ObjectCacheError> {
        let path = self.object_path(digest);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectCacheError::io(path, e)),
        }
    }

    /// Opens an object for reading, returning its size and a reader.
    pub fn get(&self, digest: &Digest) -> Result<(u64, File), ObjectCacheError> {
        let path = self.object_path(digest);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectCacheError::NotFound(*digest))
            }
            Err(e) => return Err(ObjectCacheError::io(path, e)),
        };
        let size = file
            .metadata()
            .map_err(|e| ObjectCacheError::io(&path, e))?
            .len();
        Ok((size, file))
    }

    /// Starts a streaming insertion of `digest`.
    pub fn writer(&self, digest: &Digest, size: u64) -> Result<ObjectWriter, ObjectCacheError> {
        let path = self.object_path(digest);
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|e| ObjectCacheError::io(parent, e))?;
        }
        ObjectWriter::create(*digest, size, path)
    }

    /// Inserts an object read from `reader`, verifying digest and size.
    pub fn put(
        &self,
        digest: &Digest,
        size: u64,
        mut reader: impl Read,
    ) -> Result<(), ObjectCacheError> {
        let mut writer = self.writer(digest, size)?;
        let mut buffer = vec![0u8; COPY_BUFFER_LEN];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ObjectCacheError::io(self.object_path(digest), e)),
            };
            writer.write_chunk(&buffer[..n])?;
        }
        writer.commit()?;
        Ok(())
    }

    /// Copies a local file into the cache under `digest`.
    ///
    /// Returns the object size. The file content must hash to `digest`.
    pub fn copy_in(&self, source: &Path, digest: &Digest) -> Result<u64, ObjectCacheError> {
        let file = File::open(source).map_err(|e| ObjectCacheError::io(source, e))?;
        let size = file
            .metadata()
            .map_err(|e| ObjectCacheError::io(source, e))?
            .len();
        self.put(digest, size, file)?;
        Ok(size)
    }

    /// Adds a local file to the cache under `digest` as a hard link rather
    /// than a copy. The content is not rehashed.
    ///
    /// Returns `Ok(None)` when linking is not possible (the file has other
    /// names, or lives on another filesystem); callers fall back to
    /// [`copy_in`](Self::copy_in).
    pub fn link_in(&self, source: &Path, digest: &Digest) -> Result<Option<u64>, ObjectCacheError> {
        let meta = fs::symlink_metadata(source).map_err(|e| ObjectCacheError::io(source, e))?;
        if !meta.file_type().is_file() || meta.nlink() != 1 {
            return Ok(None);
        }
        let path = self.object_path(digest);
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|e| ObjectCacheError::io(parent, e))?;
        }
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(format!(".{}^", uuid::Uuid::new_v4().simple()));
        let temp_path = PathBuf::from(temp_name);
        match fs::hard_link(source, &temp_path) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => return Ok(None),
            Err(e) => return Err(ObjectCacheError::io(&temp_path, e)),
        }
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(ObjectCacheError::io(&path, e));
        }
        debug!(%digest, source = %source.display(), "Linked object");
        Ok(Some(meta.len()))
    }

    /// Removes an object. Returns false if it was not present.
    pub fn remove(&self, digest: &Digest) -> Result<bool, ObjectCacheError> {
        let path = self.object_path(digest);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%digest, "Object removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ObjectCacheError::io(path, e)),
        }
    }

    /// Materialises `uses - 1` extra copies of an object used by `uses` new
    /// paths. Copies are numbered `~1~` to `~{uses-1}~`.
    pub fn make_copies(&self, digest: &Digest, uses: u64) -> Result<(), ObjectCacheError> {
        let source = self.object_path(digest);
        if !source.is_file() {
            return Err(ObjectCacheError::NotFound(*digest));
        }
        for k in 1..uses {
            let target = self.copy_path(digest, k);
            fs::copy(&source, &target).map_err(|e| ObjectCacheError::io(&target, e))?;
            debug!(%digest, copy = k, "Copied object");
        }
        Ok(())
    }

    /// Path of the physical copy to consume for the next of `remaining`
    /// pending uses: the highest numbered copy first, the object itself last.
    pub fn consumable_path(&self, digest: &Digest, remaining: u64) -> PathBuf {
        if remaining > 1 {
            self.copy_path(digest, remaining - 1)
        } else {
            self.object_path(digest)
        }
    }

    /// Walks the cache directory and returns every verified object.
    ///
    /// Entries whose names are not digest encodings are removed. In-flight
    /// insertions (`^` suffix) and dedup copies (`~` suffix) are left alone,
    /// so this is safe while a Fetch or Update is writing.
    pub fn scan(&self) -> Result<ObjectCacheState, ObjectCacheError> {
        self.walk(Leftovers::Keep)
    }

    /// Like [`scan`](Self::scan), but also removes insertions and dedup
    /// copies left behind by an interrupted Fetch or Update. Only call this
    /// while nothing is writing to the cache.
    pub fn scan_and_reclaim(&self) -> Result<ObjectCacheState, ObjectCacheError> {
        self.walk(Leftovers::Remove)
    }

    fn walk(&self, leftovers: Leftovers) -> Result<ObjectCacheState, ObjectCacheError> {
        let mut state = ObjectCacheState::new();
        let mut removed = 0usize;
        let entries = fs::read_dir(&self.dir).map_err(|e| ObjectCacheError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ObjectCacheError::io(&self.dir, e))?;
            let path = entry.path();
            let name = entry.file_name();
            let prefix = name.to_str().filter(|n| n.len() == 2 && is_lower_hex(n));
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let Some(prefix) = prefix.filter(|_| is_dir) else {
                remove_any(&path);
                removed += 1;
                continue;
            };
            let files = fs::read_dir(&path).map_err(|e| ObjectCacheError::io(&path, e))?;
            for file in files {
                let file = file.map_err(|e| ObjectCacheError::io(&path, e))?;
                let file_path = file.path();
                let Some(rest) = file.file_name().to_str().map(str::to_owned) else {
                    remove_any(&file_path);
                    removed += 1;
                    continue;
                };
                if rest.ends_with('^') || rest.ends_with('~') {
                    if leftovers == Leftovers::Remove {
                        remove_any(&file_path);
                        removed += 1;
                    }
                    continue;
                }
                let is_file = file.file_type().map(|t| t.is_file()).unwrap_or(false);
                match Self::digest_from_names(prefix, &rest).filter(|_| is_file) {
                    Some(digest) => {
                        // Racing with a removal is fine.
                        if let Ok(meta) = file.metadata() {
                            state.insert(digest, meta.len());
                        }
                    }
                    None => {
                        remove_any(&file_path);
                        removed += 1;
                    }
                }
            }
        }
        info!(
            objects = state.len(),
            bytes = state.total_bytes(),
            removed,
            "Object cache scanned"
        );
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leftovers {
    Keep,
    Remove,
}

fn is_lower_hex(text: &str) -> bool {
    text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn remove_any(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => info!(path = %path.display(), "Removed stray object cache entry"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stray object cache entry"),
    }
}
