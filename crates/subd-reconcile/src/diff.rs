//! Diff engine
//!
//! Compares the local tree and object cache against a target image. Two
//! results come out of it:
//!
//! - [`compute_missing`]: objects the image needs that exist neither in the
//!   cache nor anywhere on the local filesystem. These are fetched first.
//! - [`compute_change_set`]: the ordered [`ChangeSet`] that converges the
//!   local filesystem onto the image once every object is available.
//!
//! Both walks are keyed by pathname. Directories are visited before their
//! contents, entries in name order, so the change set lists parents first.

use std::collections::{BTreeMap, HashMap, HashSet};

use subd_core::domain::{
    is_within, join_path, ChangeSet, Digest, DirectoryInode, FileSystemTree, FileToCopy, Hardlink,
    Image, Inode, NamedInode, ObjectCacheState, ROOT_PATH,
};
use tracing::{debug, warn};

/// Objects the image needs that are not available locally, with their sizes.
///
/// Only paths the update would create count; entries under excluded paths
/// are never needed. Zero-length files need no object. Content present
/// anywhere in the local tree is not missing: the update copies it into the
/// cache instead.
pub fn compute_missing(
    current: &FileSystemTree,
    cache: &ObjectCacheState,
    image: &Image,
) -> BTreeMap<Digest, u64> {
    image
        .tree
        .walk()
        .filter(|(path, _, _)| !image.excludes(path))
        .filter_map(|(_, _, inode)| inode.object_digest())
        .filter(|(digest, _)| !cache.contains(digest) && !current.contains_digest(digest))
        .collect()
}

/// Computes the ordered change set converging `current` onto `image`.
pub fn compute_change_set(
    current: &FileSystemTree,
    cache: &ObjectCacheState,
    image: &Image,
) -> ChangeSet {
    let mut diff = Diff {
        current,
        image,
        change_set: ChangeSet::new(image.name.clone()),
        required_to_current: HashMap::new(),
        current_to_required: HashMap::new(),
        inodes_changed: HashSet::new(),
        inodes_created: HashMap::new(),
        object_uses: cache.iter().map(|(digest, _)| (*digest, 0)).collect(),
    };
    diff.compare_root();
    diff.compare_directories(current.root(), image.tree.root(), ROOT_PATH);

    let Diff {
        mut change_set,
        object_uses,
        ..
    } = diff;
    change_set.multiply_used_objects = object_uses
        .into_iter()
        .filter(|(_, uses)| *uses > 1)
        .collect();
    change_set.triggers = image.triggers.clone();
    mark_moved_files(current, &mut change_set);
    debug!(
        image = %image.name,
        operations = change_set.operation_count(),
        copies = change_set.files_to_copy_to_cache.len(),
        multiply_used = change_set.multiply_used_objects.len(),
        "Change set computed"
    );
    change_set
}

struct Diff<'a> {
    current: &'a FileSystemTree,
    image: &'a Image,
    change_set: ChangeSet,
    /// Image inode number to the local inode standing in for it, and the
    /// managed path where that local inode is kept
    required_to_current: HashMap<u64, (u64, String)>,
    current_to_required: HashMap<u64, u64>,
    /// Image inodes already scheduled for a metadata change
    inodes_changed: HashSet<u64>,
    /// Image inodes already scheduled for creation, with the created path
    inodes_created: HashMap<u64, String>,
    /// Pending creations per cached object
    object_uses: HashMap<Digest, u64>,
}

impl<'a> Diff<'a> {
    fn compare_root(&mut self) {
        let (Some(current), Some(required)) = (self.current.root(), self.image.tree.root()) else {
            return;
        };
        if current.mode != required.mode || current.uid != required.uid || current.gid != required.gid {
            self.change_set.inodes_to_change.push(NamedInode {
                name: ROOT_PATH.to_string(),
                inode: bare_directory(required),
            });
        }
    }

    fn compare_directories(
        &mut self,
        current_dir: Option<&'a DirectoryInode>,
        required_dir: Option<&'a DirectoryInode>,
        path: &str,
    ) {
        let Some(required_dir) = required_dir else {
            return;
        };
        let (image, current_tree) = (self.image, self.current);
        if let Some(current_dir) = current_dir {
            if !image.is_sparse() {
                for entry in &current_dir.entries {
                    let child = join_path(path, &entry.name);
                    if image.excludes(&child) {
                        continue;
                    }
                    if required_dir.entry(&entry.name).is_none() {
                        self.change_set.paths_to_delete.push(child);
                    }
                }
            }
        }
        for entry in &required_dir.entries {
            let child = join_path(path, &entry.name);
            if image.excludes(&child) {
                continue;
            }
            let Some(required) = image.tree.inode(entry.inode_number) else {
                continue;
            };
            let current = current_dir
                .and_then(|dir| dir.entry(&entry.name))
                .and_then(|e| current_tree.inode(e.inode_number).map(|inode| (e.inode_number, inode)));
            match current {
                None => self.add_entry(entry.inode_number, required, &child),
                Some((current_number, current_inode)) => self.compare_entries(
                    current_number,
                    current_inode,
                    entry.inode_number,
                    required,
                    &child,
                ),
            }
            if let Inode::Directory(required_subdir) = required {
                let current_subdir = current.and_then(|(_, inode)| inode.as_directory());
                self.compare_directories(current_subdir, Some(required_subdir), &child);
            }
        }
    }

    fn add_entry(&mut self, required_number: u64, required: &Inode, path: &str) {
        match required {
            Inode::Directory(dir) => self.change_set.directories_to_make.push(NamedInode {
                name: path.to_string(),
                inode: bare_directory(dir),
            }),
            _ => self.add_inode(required_number, required, path),
        }
    }

    fn compare_entries(
        &mut self,
        current_number: u64,
        current: &Inode,
        required_number: u64,
        required: &Inode,
        path: &str,
    ) {
        let cmp = current.compare(required);
        if let Inode::Directory(dir) = required {
            if cmp.same_type && cmp.same_metadata {
                return;
            }
            let inode = NamedInode {
                name: path.to_string(),
                inode: bare_directory(dir),
            };
            if cmp.same_type {
                self.change_set.inodes_to_change.push(inode);
            } else {
                self.change_set.paths_to_delete.push(path.to_string());
                self.change_set.directories_to_make.push(inode);
            }
            return;
        }
        if cmp.same_type && cmp.same_data {
            if !self.relink(current_number, required_number, path) {
                // The local inode already stands in for another image inode.
                self.change_set.paths_to_delete.push(path.to_string());
                self.add_inode(required_number, required, path);
                return;
            }
            if !cmp.same_metadata {
                self.update_metadata(required_number, required, path);
            }
            return;
        }
        self.change_set.paths_to_delete.push(path.to_string());
        self.add_inode(required_number, required, path);
    }

    /// Keeps the hardlink structure of the image on existing paths.
    ///
    /// Returns false if the local inode at `path` is already claimed by a
    /// different image inode, in which case the path must be recreated.
    fn relink(&mut self, current_number: u64, required_number: u64, path: &str) -> bool {
        if let Some(&claimed_by) = self.current_to_required.get(&current_number) {
            if claimed_by != required_number {
                return false;
            }
        }
        match self.required_to_current.get(&required_number) {
            None => {
                self.required_to_current
                    .insert(required_number, (current_number, path.to_string()));
                self.current_to_required.insert(current_number, required_number);
            }
            Some((mapped, _)) if *mapped == current_number => {}
            Some((_, kept)) => {
                // Other local names of the kept inode may be replaced.
                self.change_set.hardlinks_to_make.push(Hardlink {
                    new_link: path.to_string(),
                    target: kept.clone(),
                });
            }
        }
        true
    }

    fn update_metadata(&mut self, required_number: u64, required: &Inode, path: &str) {
        if self.inodes_changed.insert(required_number) {
            self.change_set.inodes_to_change.push(NamedInode {
                name: path.to_string(),
                inode: required.clone(),
            });
        }
    }

    fn add_inode(&mut self, required_number: u64, required: &Inode, path: &str) {
        if let Some(created) = self.inodes_created.get(&required_number) {
            self.change_set.hardlinks_to_make.push(Hardlink {
                new_link: path.to_string(),
                target: created.clone(),
            });
            return;
        }
        if self.link_to_sibling(required_number, required, path) {
            return;
        }
        if let Some((digest, _)) = required.object_digest() {
            self.use_object(digest, path);
        }
        self.change_set.inodes_to_make.push(NamedInode {
            name: path.to_string(),
            inode: required.clone(),
        });
        self.inodes_created.insert(required_number, path.to_string());
    }

    /// Links `path` to another local name of the same image inode that
    /// already holds the right content.
    fn link_to_sibling(&mut self, required_number: u64, required: &Inode, path: &str) -> bool {
        let (image, current_tree) = (self.image, self.current);
        let names = image.tree.paths_of(required_number);
        if names.len() < 2 {
            return false;
        }
        let mut same_data_name = None;
        for name in names {
            if name == path {
                continue;
            }
            let Some((_, local)) = current_tree.lookup(name) else {
                continue;
            };
            let cmp = local.compare(required);
            if !(cmp.same_type && cmp.same_data) {
                continue;
            }
            if cmp.same_metadata {
                self.change_set.hardlinks_to_make.push(Hardlink {
                    new_link: path.to_string(),
                    target: name.clone(),
                });
                return true;
            }
            same_data_name.get_or_insert(name);
        }
        match same_data_name {
            Some(name) => {
                self.update_metadata(required_number, required, name);
                self.change_set.hardlinks_to_make.push(Hardlink {
                    new_link: path.to_string(),
                    target: name.clone(),
                });
                true
            }
            None => false,
        }
    }

    /// Counts one more creation consuming `digest` from the cache.
    fn use_object(&mut self, digest: Digest, path: &str) {
        if let Some(uses) = self.object_uses.get_mut(&digest) {
            *uses += 1;
            return;
        }
        let current_tree = self.current;
        match current_tree.path_for_digest(&digest) {
            Some(source) => self.change_set.files_to_copy_to_cache.push(FileToCopy {
                name: source.to_string(),
                digest,
                do_hardlink: false,
            }),
            None => warn!(path, %digest, "Object neither cached nor present locally"),
        }
        self.object_uses.insert(digest, 1);
    }
}

/// Lets the applier link a file into the cache rather than copy it when the
/// file's only name goes away in the same update.
fn mark_moved_files(current: &FileSystemTree, change_set: &mut ChangeSet) {
    let ChangeSet {
        files_to_copy_to_cache,
        paths_to_delete,
        ..
    } = change_set;
    for file in files_to_copy_to_cache.iter_mut() {
        let single_name = current
            .lookup(&file.name)
            .is_some_and(|(number, _)| current.paths_of(number).len() == 1);
        file.do_hardlink =
            single_name && paths_to_delete.iter().any(|deleted| is_within(&file.name, deleted));
    }
}

fn bare_directory(dir: &DirectoryInode) -> Inode {
    Inode::Directory(DirectoryInode {
        mode: dir.mode,
        uid: dir.uid,
        gid: dir.gid,
        entries: Vec::new(),
    })
}
