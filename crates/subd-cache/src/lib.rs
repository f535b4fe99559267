//! subd Cache - Content-addressed object store
//!
//! Objects are stored under the Sub's private working directory, one file
//! per digest, in a two-level directory layout:
//! `{objects_dir}/{first_2_hex_chars}/{remaining_126_hex_chars}`.
//!
//! ## Key Components
//!
//! - [`ObjectCache`] - Existence checks, retrieval, verified insertion,
//!   removal, dedup copies and directory rescans
//! - [`ObjectWriter`] - Streaming insertion that is only visible under the
//!   digest name once content and size have been verified
//! - [`ObjectCacheError`] - Error types for cache operations
//!
//! ## Naming
//!
//! - `<object>` - a verified object
//! - `<object>.<uuid>^` - an insertion in progress
//! - `<object>~<k>~` - the k-th dedup copy of an object, consumed by an update

pub mod error;
pub mod store;
pub mod writer;

pub use error::ObjectCacheError;
pub use store::ObjectCache;
pub use writer::ObjectWriter;
