//! Streaming, verified object insertion.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use sha2::{Digest as _, Sha512};
use subd_core::domain::Digest;
use tracing::{debug, warn};

use crate::error::ObjectCacheError;

/// Writes one object to a temporary name and renames it into place on
/// [`ObjectWriter::commit`].
///
/// Dropping an uncommitted writer removes the temporary file, so a digest
/// name never refers to incomplete content.
pub struct ObjectWriter {
    digest: Digest,
    expected_size: u64,
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    hasher: Sha512,
    written: u64,
}

impl ObjectWriter {
    pub(crate) fn create(
        digest: Digest,
        expected_size: u64,
        final_path: PathBuf,
    ) -> Result<Self, ObjectCacheError> {
        let mut temp_name = final_path.as_os_str().to_owned();
        temp_name.push(format!(".{}^", uuid::Uuid::new_v4().simple()));
        let temp_path = PathBuf::from(temp_name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&temp_path)
            .map_err(|e| ObjectCacheError::io(&temp_path, e))?;
        Ok(Self {
            digest,
            expected_size,
            final_path,
            temp_path,
            file: Some(file),
            hasher: Sha512::new(),
            written: 0,
        })
    }

    /// Appends a chunk of content
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ObjectCacheError> {
        let Some(file) = self.file.as_mut() else {
            return Err(ObjectCacheError::io(
                &self.temp_path,
                std::io::Error::new(std::io::ErrorKind::Other, "writer already closed"),
            ));
        };
        file.write_all(chunk)
            .map_err(|e| ObjectCacheError::io(&self.temp_path, e))?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verifies size and digest, syncs, and renames into place
    ///
    /// A concurrent commit of the same digest is harmless: both files hold
    /// identical content and the last rename wins.
    pub fn commit(mut self) -> Result<u64, ObjectCacheError> {
        let Some(file) = self.file.take() else {
            return Err(ObjectCacheError::io(
                &self.temp_path,
                std::io::Error::new(std::io::ErrorKind::Other, "writer already closed"),
            ));
        };
        if self.written != self.expected_size {
            return Err(ObjectCacheError::SizeMismatch {
                digest: self.digest,
                expected: self.expected_size,
                actual: self.written,
            });
        }
        let hasher = std::mem::replace(&mut self.hasher, Sha512::new());
        let actual = Digest::from_hasher(hasher);
        if actual != self.digest {
            return Err(ObjectCacheError::DigestMismatch {
                expected: self.digest,
                actual,
            });
        }
        file.sync_all()
            .map_err(|e| ObjectCacheError::io(&self.temp_path, e))?;
        drop(file);
        fs::rename(&self.temp_path, &self.final_path)
            .map_err(|e| ObjectCacheError::io(&self.final_path, e))?;
        debug!(digest = %self.digest, size = self.written, "Object stored");
        Ok(self.written)
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        // After a successful commit the temp name no longer exists.
        match fs::remove_file(&self.temp_path) {
            Ok(()) => debug!(path = %self.temp_path.display(), "Discarded partial object"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.temp_path.display(), error = %e, "Failed to remove partial object"),
        }
    }
}
