//! Filesystem primitives used by the update applier
//!
//! Every function works on host paths. Metadata writes never follow
//! symlinks.

use std::ffi::CString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{lchown, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use subd_core::domain::{
    file_type_bits, permission_bits, DirectoryInode, Inode, Mtime, SpecialInode, S_IFBLK, S_IFCHR,
    S_IFIFO,
};

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// A sibling of `path` used to stage a new entry before renaming it in.
pub fn staging_path(path: &Path, tag: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{tag}.{}", std::process::id()));
    PathBuf::from(name)
}

/// Removes `path` whatever it is. A missing path is not an error.
pub fn force_remove_all(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Renames `from` over `to`, first removing `to` if it is a directory.
pub fn force_rename(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(first) => match fs::symlink_metadata(to) {
            Ok(meta) if meta.is_dir() => {
                fs::remove_dir_all(to)?;
                fs::rename(from, to)
            }
            _ => Err(first),
        },
    }
}

/// Creates an empty file that must not already exist.
pub fn create_empty(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map(drop)
}

pub fn set_mtime(path: &Path, mtime: Mtime) -> io::Result<()> {
    let c_path = c_path(path)?;
    let time = libc::timespec {
        tv_sec: mtime.seconds as libc::time_t,
        tv_nsec: mtime.nanoseconds as libc::c_long,
    };
    let times = [time, time];
    // SAFETY: c_path is NUL-terminated and times holds two timespecs.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, Permissions::from_mode(permission_bits(mode)))
}

/// Writes ownership, permissions and mtime as the inode type allows.
pub fn write_metadata(path: &Path, inode: &Inode) -> io::Result<()> {
    lchown(path, Some(inode.uid()), Some(inode.gid()))?;
    if matches!(inode, Inode::Symlink(_)) {
        return Ok(());
    }
    set_mode(path, inode.mode())?;
    match inode.mtime() {
        Some(mtime) => set_mtime(path, mtime),
        None => Ok(()),
    }
}

/// Creates the directory at `path`, or adopts an existing one, and applies
/// its ownership and permissions. A non-directory in the way is removed.
pub fn make_directory(path: &Path, dir: &DirectoryInode) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            force_remove_all(path)?;
            fs::create_dir(path)?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => fs::create_dir(path)?,
        Err(e) => return Err(e),
    }
    lchown(path, Some(dir.uid), Some(dir.gid))?;
    set_mode(path, dir.mode)
}

/// Creates a device node or FIFO at `path`, which must not exist.
pub fn make_special(path: &Path, inode: &SpecialInode) -> io::Result<()> {
    let c_path = c_path(path)?;
    let rc = match file_type_bits(inode.mode) {
        // SAFETY: c_path is NUL-terminated.
        S_IFBLK | S_IFCHR => unsafe {
            libc::mknod(
                c_path.as_ptr(),
                inode.mode as libc::mode_t,
                inode.rdev as libc::dev_t,
            )
        },
        // SAFETY: c_path is NUL-terminated.
        S_IFIFO => unsafe { libc::mkfifo(c_path.as_ptr(), permission_bits(inode.mode) as libc::mode_t) },
        other => {
            return Err(io::Error::new(
                ErrorKind::Unsupported,
                format!("unsupported special file type {other:o}"),
            ))
        }
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
