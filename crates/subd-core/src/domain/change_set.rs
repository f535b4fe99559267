//! ChangeSet domain entity
//!
//! The ordered description of everything an update must do to converge the
//! local filesystem onto a target image. Lists are applied in field order:
//! copy files into the cache, make object copies, make directories, make
//! inodes, make hardlinks, delete paths, change metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::inode::Inode;
use super::newtypes::Digest;
use super::triggers::Trigger;

/// A local file whose content should be copied into the object cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileToCopy {
    /// Managed pathname of an existing local file
    pub name: String,
    pub digest: Digest,
    /// Link the file into the cache instead of copying it. Only set when
    /// the file's sole name is deleted by the same change set.
    #[serde(default)]
    pub do_hardlink: bool,
}

/// An inode to create (or whose metadata to change) at a pathname
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedInode {
    pub name: String,
    pub inode: Inode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardlink {
    pub new_link: String,
    /// Existing (or earlier-created) pathname to link to
    pub target: String,
}

/// Ordered update instructions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub image_name: String,
    #[serde(default)]
    pub files_to_copy_to_cache: Vec<FileToCopy>,
    #[serde(default)]
    pub directories_to_make: Vec<NamedInode>,
    #[serde(default)]
    pub inodes_to_make: Vec<NamedInode>,
    #[serde(default)]
    pub hardlinks_to_make: Vec<Hardlink>,
    #[serde(default)]
    pub paths_to_delete: Vec<String>,
    #[serde(default)]
    pub inodes_to_change: Vec<NamedInode>,
    /// Objects needed by more than one created path, with their use count
    #[serde(default)]
    pub multiply_used_objects: BTreeMap<Digest, u64>,
    /// Triggers of the target image
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl ChangeSet {
    pub fn new(image_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            ..Self::default()
        }
    }

    /// Returns true if applying this change set would not touch the filesystem
    pub fn is_empty(&self) -> bool {
        self.files_to_copy_to_cache.is_empty()
            && self.directories_to_make.is_empty()
            && self.inodes_to_make.is_empty()
            && self.hardlinks_to_make.is_empty()
            && self.paths_to_delete.is_empty()
            && self.inodes_to_change.is_empty()
            && self.multiply_used_objects.is_empty()
    }

    /// Every pathname the update creates, deletes or changes, in apply order
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.directories_to_make
            .iter()
            .map(|e| e.name.as_str())
            .chain(self.inodes_to_make.iter().map(|e| e.name.as_str()))
            .chain(self.hardlinks_to_make.iter().map(|h| h.new_link.as_str()))
            .chain(self.paths_to_delete.iter().map(String::as_str))
            .chain(self.inodes_to_change.iter().map(|e| e.name.as_str()))
    }

    /// Total number of filesystem operations
    pub fn operation_count(&self) -> usize {
        self.files_to_copy_to_cache.len()
            + self.directories_to_make.len()
            + self.inodes_to_make.len()
            + self.hardlinks_to_make.len()
            + self.paths_to_delete.len()
            + self.inodes_to_change.len()
    }
}
