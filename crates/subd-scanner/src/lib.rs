//! subd Scanner - Filesystem snapshots and I/O pacing
//!
//! This crate provides:
//! - [`RateLimiter`] - pacing object that throttles reads to a percentage of
//!   measured capacity, shared by the scanner and the object fetcher
//! - [`scan`] - walks the managed root and builds an immutable
//!   [`FileSystemTree`](subd_core::domain::FileSystemTree), hashing every
//!   regular file through the rate limiter
//! - [`FileSystemHistory`] - latest snapshot, object cache state and the
//!   generation counter reported by Poll
//! - [`ScanDaemon`] / [`ScannerHandle`] - the background scan loop and the
//!   pause/resume rendezvous used before disk-intensive work
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use subd_core::domain::Filter;
//! use subd_scanner::{scan, RateLimiter, ScanOutcome};
//!
//! # fn example() -> anyhow::Result<()> {
//! let rate = RateLimiter::new("disk", 0, 100);
//! let filter = Filter::new(["/proc", "/sys"])?;
//! if let ScanOutcome::Complete(result) = scan(Path::new("/"), &filter, &rate, &|| false)? {
//!     println!("{} paths", result.tree.path_count());
//! }
//! # Ok(())
//! # }
//! ```

pub mod daemon;
pub mod error;
pub mod history;
pub mod rate_limit;
pub mod walk;

pub use daemon::{ScanDaemon, ScanPause, ScanSettings, ScannerHandle};
pub use error::ScanError;
pub use history::{FileSystemHistory, HistorySnapshot};
pub use rate_limit::{RateLimitedReader, RateLimiter};
pub use walk::{scan, scan_with_options, ScanOptions, ScanOutcome, ScanResult};
