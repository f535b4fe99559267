//! Domain entities and business logic
//!
//! - Newtypes for content digests and managed pathnames
//! - Inode variants and the immutable filesystem tree
//! - Path exclusion filters and service triggers
//! - Target images, object cache state and change sets
//! - The reconciliation state machine
//! - Domain-specific error types

pub mod cache_state;
pub mod change_set;
pub mod errors;
pub mod filter;
pub mod image;
pub mod inode;
pub mod newtypes;
pub mod reconciliation;
pub mod tree;
pub mod triggers;

// Re-export commonly used types
pub use cache_state::ObjectCacheState;
pub use change_set::{ChangeSet, FileToCopy, Hardlink, NamedInode};
pub use errors::DomainError;
pub use filter::Filter;
pub use image::Image;
pub use inode::{
    file_type_bits, permission_bits, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG,
    S_IFSOCK,
};
pub use inode::{
    DirectoryEntry, DirectoryInode, Inode, InodeComparison, InodeKind, Mtime, RegularInode,
    SpecialInode, SymlinkInode,
};
pub use newtypes::*;
pub use reconciliation::{Phase, ReconciliationState};
pub use tree::{FileSystemTree, TreeBuilder};
pub use triggers::{
    load_triggers, merge_triggers, save_triggers, Trigger, TriggerAction, TriggerSet, REBOOT_SERVICE,
    SELF_SERVICE,
};
