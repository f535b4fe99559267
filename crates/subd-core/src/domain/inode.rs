//! Inode variants
//!
//! An inode is a closed enum over the four object kinds a managed tree can
//! hold. Inodes are immutable values: the scanner builds them once and the
//! diff engine only compares them.
//!
//! `mode` always carries the full `st_mode` value, file-type bits included.

use serde::{Deserialize, Serialize};

use super::newtypes::Digest;

// ============================================================================
// Mode bits
// ============================================================================

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFSOCK: u32 = 0o140_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFIFO: u32 = 0o010_000;

/// Permission, setuid, setgid and sticky bits of a mode
pub fn permission_bits(mode: u32) -> u32 {
    mode & 0o7777
}

/// File-type bits of a mode
pub fn file_type_bits(mode: u32) -> u32 {
    mode & S_IFMT
}

/// Modification time with nanosecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Mtime {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl Mtime {
    pub const fn new(seconds: i64, nanoseconds: u32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }
}

// ============================================================================
// Inode kinds
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegularInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: Mtime,
    pub size: u64,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymlinkInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub target: String,
}

/// Device node, FIFO or any other non-regular, non-directory object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecialInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: Mtime,
    pub rdev: u64,
}

/// Named reference from a directory to an inode number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub inode_number: u64,
}

/// Directory with entries sorted by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryInode {
    /// Looks up an entry by name (entries are kept sorted)
    pub fn entry(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.entries[index])
    }
}

/// Discriminant of an [`Inode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InodeKind {
    Regular,
    Symlink,
    Special,
    Directory,
}

impl std::fmt::Display for InodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InodeKind::Regular => write!(f, "regular"),
            InodeKind::Symlink => write!(f, "symlink"),
            InodeKind::Special => write!(f, "special"),
            InodeKind::Directory => write!(f, "directory"),
        }
    }
}

/// A filesystem object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inode {
    Regular(RegularInode),
    Symlink(SymlinkInode),
    Special(SpecialInode),
    Directory(DirectoryInode),
}

/// Result of comparing two inodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeComparison {
    /// Same variant (and, for specials, same file-type bits)
    pub same_type: bool,
    /// Mode, ownership and (where relevant) mtime match
    pub same_metadata: bool,
    /// Content matches: digest and size, link target or device number
    pub same_data: bool,
}

impl InodeComparison {
    pub fn identical(&self) -> bool {
        self.same_type && self.same_metadata && self.same_data
    }
}

impl Inode {
    pub fn kind(&self) -> InodeKind {
        match self {
            Inode::Regular(_) => InodeKind::Regular,
            Inode::Symlink(_) => InodeKind::Symlink,
            Inode::Special(_) => InodeKind::Special,
            Inode::Directory(_) => InodeKind::Directory,
        }
    }

    pub fn mode(&self) -> u32 {
        match self {
            Inode::Regular(i) => i.mode,
            Inode::Symlink(i) => i.mode,
            Inode::Special(i) => i.mode,
            Inode::Directory(i) => i.mode,
        }
    }

    pub fn uid(&self) -> u32 {
        match self {
            Inode::Regular(i) => i.uid,
            Inode::Symlink(i) => i.uid,
            Inode::Special(i) => i.uid,
            Inode::Directory(i) => i.uid,
        }
    }

    pub fn gid(&self) -> u32 {
        match self {
            Inode::Regular(i) => i.gid,
            Inode::Symlink(i) => i.gid,
            Inode::Special(i) => i.gid,
            Inode::Directory(i) => i.gid,
        }
    }

    /// Modification time, for the kinds that carry one
    pub fn mtime(&self) -> Option<Mtime> {
        match self {
            Inode::Regular(i) => Some(i.mtime),
            Inode::Special(i) => Some(i.mtime),
            Inode::Symlink(_) | Inode::Directory(_) => None,
        }
    }

    pub fn as_regular(&self) -> Option<&RegularInode> {
        match self {
            Inode::Regular(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryInode> {
        match self {
            Inode::Directory(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Inode::Directory(_))
    }

    /// Digest of a non-empty regular file
    ///
    /// Zero-length files need no object and therefore have no usable digest.
    pub fn object_digest(&self) -> Option<(Digest, u64)> {
        match self {
            Inode::Regular(i) if i.size > 0 => Some((i.digest, i.size)),
            _ => None,
        }
    }

    /// Compares two inodes the way the diff engine needs
    pub fn compare(&self, other: &Inode) -> InodeComparison {
        match (self, other) {
            (Inode::Regular(l), Inode::Regular(r)) => InodeComparison {
                same_type: true,
                same_metadata: l.mode == r.mode
                    && l.uid == r.uid
                    && l.gid == r.gid
                    && l.mtime == r.mtime,
                same_data: l.size == r.size && l.digest == r.digest,
            },
            // Symlink permissions are not settable on Linux.
            (Inode::Symlink(l), Inode::Symlink(r)) => InodeComparison {
                same_type: true,
                same_metadata: l.uid == r.uid && l.gid == r.gid,
                same_data: l.target == r.target,
            },
            (Inode::Special(l), Inode::Special(r)) => {
                if file_type_bits(l.mode) != file_type_bits(r.mode) {
                    return InodeComparison::default();
                }
                InodeComparison {
                    same_type: true,
                    same_metadata: l.mode == r.mode
                        && l.uid == r.uid
                        && l.gid == r.gid
                        && l.mtime == r.mtime,
                    same_data: l.rdev == r.rdev,
                }
            }
            (Inode::Directory(l), Inode::Directory(r)) => InodeComparison {
                same_type: true,
                same_metadata: l.mode == r.mode && l.uid == r.uid && l.gid == r.gid,
                same_data: true,
            },
            _ => InodeComparison::default(),
        }
    }
}
