//! FileSystemTree domain entity
//!
//! An immutable snapshot of a managed filesystem: a root directory inode
//! plus a map from inode number to [`Inode`]. Several pathnames may share an
//! inode number (hardlinks).
//!
//! The pathname index (the "entry map") is built lazily on first lookup and
//! cached for the lifetime of the tree. A tree is never mutated; the next
//! scan supersedes it wholesale.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::inode::{DirectoryEntry, DirectoryInode, Inode, S_IFDIR};
use super::newtypes::{join_path, parent_path, validate_managed_path, Digest, ROOT_PATH};

#[derive(Debug, Clone, Default)]
struct PathIndex {
    by_path: BTreeMap<String, u64>,
    paths_by_inode: HashMap<u64, Vec<String>>,
    inodes_by_digest: HashMap<Digest, Vec<u64>>,
}

/// Immutable filesystem snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystemTree {
    root_inode: u64,
    inodes: BTreeMap<u64, Inode>,
    #[serde(skip)]
    index: OnceLock<PathIndex>,
}

impl FileSystemTree {
    /// Builds a tree from raw parts, checking that it is well formed
    pub fn from_parts(root_inode: u64, inodes: BTreeMap<u64, Inode>) -> Result<Self, DomainError> {
        let tree = Self {
            root_inode,
            inodes,
            index: OnceLock::new(),
        };
        tree.validate()?;
        Ok(tree)
    }

    /// A tree holding only an empty root directory
    pub fn empty(root: DirectoryInode) -> Self {
        TreeBuilder::new(root).build()
    }

    /// Checks that the root is a directory and every entry resolves
    pub fn validate(&self) -> Result<(), DomainError> {
        match self.inodes.get(&self.root_inode) {
            Some(Inode::Directory(_)) => {}
            Some(_) => {
                return Err(DomainError::InvalidTree(
                    "root inode is not a directory".to_string(),
                ))
            }
            None => {
                return Err(DomainError::InvalidTree(format!(
                    "root inode {} missing",
                    self.root_inode
                )))
            }
        }
        for (number, inode) in &self.inodes {
            if let Inode::Directory(dir) = inode {
                for entry in &dir.entries {
                    if !self.inodes.contains_key(&entry.inode_number) {
                        return Err(DomainError::InvalidTree(format!(
                            "directory inode {number} references missing inode {} ({})",
                            entry.inode_number, entry.name
                        )));
                    }
                    if entry.name.is_empty() || entry.name.contains('/') {
                        return Err(DomainError::InvalidTree(format!(
                            "invalid entry name {:?}",
                            entry.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn root_inode_number(&self) -> u64 {
        self.root_inode
    }

    /// The root directory
    pub fn root(&self) -> Option<&DirectoryInode> {
        self.inodes.get(&self.root_inode).and_then(Inode::as_directory)
    }

    pub fn inode(&self, number: u64) -> Option<&Inode> {
        self.inodes.get(&number)
    }

    pub fn inodes(&self) -> &BTreeMap<u64, Inode> {
        &self.inodes
    }

    /// Resolves a pathname to its inode number and inode
    pub fn lookup(&self, path: &str) -> Option<(u64, &Inode)> {
        let number = *self.index().by_path.get(path)?;
        self.inodes.get(&number).map(|inode| (number, inode))
    }

    /// All pathnames naming `inode_number`, sorted
    pub fn paths_of(&self, inode_number: u64) -> &[String] {
        self.index()
            .paths_by_inode
            .get(&inode_number)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Regular inode numbers holding content with `digest`
    pub fn inodes_with_digest(&self, digest: &Digest) -> &[u64] {
        self.index()
            .inodes_by_digest
            .get(digest)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns true if some non-empty regular file in the tree has `digest`
    pub fn contains_digest(&self, digest: &Digest) -> bool {
        !self.inodes_with_digest(digest).is_empty()
    }

    /// First pathname of a regular file whose content is `digest`
    pub fn path_for_digest(&self, digest: &Digest) -> Option<&str> {
        self.inodes_with_digest(digest)
            .iter()
            .find_map(|number| self.paths_of(*number).first())
            .map(String::as_str)
    }

    /// Every pathname with its inode number, parents before children
    pub fn walk(&self) -> impl Iterator<Item = (&str, u64, &Inode)> + '_ {
        self.index().by_path.iter().filter_map(move |(path, number)| {
            self.inodes
                .get(number)
                .map(|inode| (path.as_str(), *number, inode))
        })
    }

    /// Number of reachable pathnames, root included
    pub fn path_count(&self) -> usize {
        self.index().by_path.len()
    }

    /// Sum of regular file sizes, counting each inode once
    pub fn total_data_bytes(&self) -> u64 {
        self.inodes
            .values()
            .filter_map(Inode::as_regular)
            .map(|inode| inode.size)
            .sum()
    }

    pub fn num_regular_inodes(&self) -> usize {
        self.inodes.values().filter(|i| i.as_regular().is_some()).count()
    }

    pub fn directory_count(&self) -> usize {
        self.inodes.values().filter(|i| i.is_directory()).count()
    }

    fn index(&self) -> &PathIndex {
        self.index.get_or_init(|| self.build_index())
    }

    fn build_index(&self) -> PathIndex {
        let mut index = PathIndex::default();
        let mut stack = vec![(ROOT_PATH.to_string(), self.root_inode)];
        while let Some((path, number)) = stack.pop() {
            let Some(inode) = self.inodes.get(&number) else {
                continue;
            };
            // A directory reachable twice would loop forever.
            if inode.is_directory() && index.paths_by_inode.contains_key(&number) {
                continue;
            }
            if let Some((digest, _)) = inode.object_digest() {
                let numbers = index.inodes_by_digest.entry(digest).or_default();
                if !numbers.contains(&number) {
                    numbers.push(number);
                }
            }
            if let Inode::Directory(dir) = inode {
                for entry in dir.entries.iter().rev() {
                    stack.push((join_path(&path, &entry.name), entry.inode_number));
                }
            }
            index
                .paths_by_inode
                .entry(number)
                .or_default()
                .push(path.clone());
            index.by_path.insert(path, number);
        }
        for paths in index.paths_by_inode.values_mut() {
            paths.sort();
        }
        for numbers in index.inodes_by_digest.values_mut() {
            numbers.sort_unstable();
        }
        index
    }
}

/// Structural equality
///
/// Two trees are equal when they name the same pathnames with identical
/// inodes and the same hardlink grouping. Raw inode numbers are ignored.
impl PartialEq for FileSystemTree {
    fn eq(&self, other: &Self) -> bool {
        if self.inodes.len() != other.inodes.len() || self.path_count() != other.path_count() {
            return false;
        }
        for (path, number, inode) in self.walk() {
            let Some((other_number, other_inode)) = other.lookup(path) else {
                return false;
            };
            if !inode.compare(other_inode).identical() {
                return false;
            }
            if self.paths_of(number) != other.paths_of(other_number) {
                return false;
            }
            if let (Inode::Directory(l), Inode::Directory(r)) = (inode, other_inode) {
                let same_names = l.entries.len() == r.entries.len()
                    && l.entries.iter().zip(&r.entries).all(|(a, b)| a.name == b.name);
                if !same_names {
                    return false;
                }
            }
        }
        true
    }
}

impl Eq for FileSystemTree {}

// ============================================================================
// TreeBuilder
// ============================================================================

/// Incremental constructor for [`FileSystemTree`]
///
/// Parents must be inserted before their children. Directory entries are
/// sorted by name when the tree is built.
#[derive(Debug)]
pub struct TreeBuilder {
    root_inode: u64,
    inodes: BTreeMap<u64, Inode>,
    directories: HashMap<String, u64>,
    next_number: u64,
}

impl TreeBuilder {
    /// Starts a tree whose root directory gets inode number 1
    pub fn new(root: DirectoryInode) -> Self {
        Self::with_root_number(1, root)
    }

    /// Starts a tree with an explicit root inode number
    pub fn with_root_number(number: u64, mut root: DirectoryInode) -> Self {
        root.entries.clear();
        let mut inodes = BTreeMap::new();
        inodes.insert(number, Inode::Directory(root));
        let mut directories = HashMap::new();
        directories.insert(ROOT_PATH.to_string(), number);
        Self {
            root_inode: number,
            inodes,
            directories,
            next_number: number + 1,
        }
    }

    /// Convenience root directory owned by `uid`/`gid` with mode 0755
    pub fn default_root(uid: u32, gid: u32) -> DirectoryInode {
        DirectoryInode {
            mode: S_IFDIR | 0o755,
            uid,
            gid,
            entries: Vec::new(),
        }
    }

    /// Adds `inode` at `path` under a freshly allocated inode number
    pub fn insert(&mut self, path: &str, inode: Inode) -> Result<u64, DomainError> {
        let number = self.next_number;
        self.insert_numbered(path, number, inode)?;
        Ok(number)
    }

    /// Adds `inode` at `path` under the given inode number
    pub fn insert_numbered(
        &mut self,
        path: &str,
        number: u64,
        mut inode: Inode,
    ) -> Result<(), DomainError> {
        if self.inodes.contains_key(&number) {
            return Err(DomainError::InvalidTree(format!(
                "inode {number} inserted twice (at {path})"
            )));
        }
        let (parent, name) = self.split(path)?;
        if let Inode::Directory(dir) = &mut inode {
            dir.entries.clear();
            self.directories.insert(path.to_string(), number);
        }
        self.inodes.insert(number, inode);
        self.add_entry(parent, name, number)?;
        self.next_number = self.next_number.max(number + 1);
        Ok(())
    }

    /// Adds another name for an existing non-directory inode
    pub fn link(&mut self, path: &str, number: u64) -> Result<(), DomainError> {
        match self.inodes.get(&number) {
            None => {
                return Err(DomainError::InvalidTree(format!(
                    "cannot link {path} to missing inode {number}"
                )))
            }
            Some(Inode::Directory(_)) => {
                return Err(DomainError::InvalidTree(format!(
                    "cannot hardlink directory inode {number} at {path}"
                )))
            }
            Some(_) => {}
        }
        let (parent, name) = self.split(path)?;
        self.add_entry(parent, name, number)
    }

    /// Returns true if `number` was already inserted
    pub fn contains(&self, number: u64) -> bool {
        self.inodes.contains_key(&number)
    }

    pub fn build(mut self) -> FileSystemTree {
        for inode in self.inodes.values_mut() {
            if let Inode::Directory(dir) = inode {
                dir.entries.sort();
            }
        }
        FileSystemTree {
            root_inode: self.root_inode,
            inodes: self.inodes,
            index: OnceLock::new(),
        }
    }

    fn split<'a>(&self, path: &'a str) -> Result<(u64, &'a str), DomainError> {
        validate_managed_path(path)?;
        let parent = parent_path(path)
            .ok_or_else(|| DomainError::InvalidPath("cannot insert the root".to_string()))?;
        let parent_number = *self.directories.get(parent).ok_or_else(|| {
            DomainError::InvalidTree(format!("parent directory of {path} not present"))
        })?;
        let name = &path[path.rfind('/').map_or(0, |i| i + 1)..];
        Ok((parent_number, name))
    }

    fn add_entry(&mut self, parent: u64, name: &str, number: u64) -> Result<(), DomainError> {
        let Some(Inode::Directory(dir)) = self.inodes.get_mut(&parent) else {
            return Err(DomainError::InvalidTree(format!(
                "inode {parent} is not a directory"
            )));
        };
        if dir.entries.iter().any(|e| e.name == name) {
            return Err(DomainError::InvalidTree(format!(
                "duplicate entry {name} in directory inode {parent}"
            )));
        }
        dir.entries.push(DirectoryEntry {
            name: name.to_string(),
            inode_number: number,
        });
        Ok(())
    }
}
