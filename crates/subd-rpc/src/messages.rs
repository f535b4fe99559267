//! Request and response bodies of the reconciliation protocol
//!
//! Every message is JSON. Digests travel as lowercase hex strings.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subd_core::domain::{ChangeSet, Digest, FileSystemTree, ObjectCacheState};

// ============================================================================
// Poll
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollRequest {
    /// Generation the caller already holds
    pub have_generation: u64,
    /// Never include the tree or object cache in the response
    pub short_poll_only: bool,
}

/// Status of the Sub, optionally followed by its latest snapshot.
///
/// `tree` and `object_cache` are set only when `file_system_follows` is.
/// They are never part of the JSON summary: over HTTP they follow it as two
/// further JSON lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    /// Measured link capacity in bytes per second, 0 if unknown
    pub network_speed: u64,
    pub fetch_in_progress: bool,
    pub update_in_progress: bool,
    pub last_fetch_error: Option<String>,
    pub last_update_error: Option<String>,
    pub last_update_had_trigger_failures: bool,
    pub last_successful_image_name: Option<String>,
    /// When the Sub process started
    pub start_time: DateTime<Utc>,
    pub poll_time: DateTime<Utc>,
    pub scan_count: u64,
    pub generation_count: u64,
    pub last_scan_time: Option<DateTime<Utc>>,
    pub last_change_time: Option<DateTime<Utc>>,
    /// Bytes of regular file content in the latest tree
    pub total_data_bytes: u64,
    pub num_regular_inodes: u64,
    pub file_system_follows: bool,
    #[serde(skip)]
    pub tree: Option<Arc<FileSystemTree>>,
    #[serde(skip)]
    pub object_cache: Option<Arc<ObjectCacheState>>,
}

// ============================================================================
// Fetch / Update / Cleanup
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Object server address, `host:port` or a full URL
    pub server_address: String,
    /// Reply only once the fetch has finished
    #[serde(default)]
    pub wait: bool,
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub wait: bool,
    pub change_set: ChangeSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    /// Objects actually deleted
    pub removed: usize,
}

/// Empty acknowledgement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

// ============================================================================
// Configuration
// ============================================================================

/// Runtime-adjustable scanner and fetcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub scan_speed_percent: u8,
    pub network_speed_percent: u8,
    /// Scan exclusion lines, excluding the private working directory
    pub scan_exclusions: Vec<String>,
}

// ============================================================================
// GetFiles
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFilesRequest {
    pub paths: Vec<String>,
}

/// Header line preceding each file in a GetFiles stream.
///
/// When `error` is empty, exactly `size` bytes of content follow the line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFileResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub size: u64,
}

/// Error body returned with every non-2xx status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
