//! Object server port (driven/secondary port)
//!
//! The object server stores blobs by digest. The Sub only ever reads from
//! it: it asks for object sizes (to decide whether a fetch is large enough
//! to benchmark the link) and streams object content into its cache.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because transport errors are adapter-specific.
//! - Object content is a stream of chunks so the caller can pace reads
//!   through a rate limiter without buffering whole objects.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::domain::newtypes::Digest;

/// Stream of content chunks for one object
pub type ObjectChunks = BoxStream<'static, anyhow::Result<Vec<u8>>>;

/// An object being downloaded
pub struct FetchedObject {
    /// Length announced by the server
    pub size: u64,
    pub chunks: ObjectChunks,
}

impl std::fmt::Debug for FetchedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Read access to a content-addressed object server
#[async_trait]
pub trait IObjectServer: Send + Sync {
    /// Address this client talks to, for logging
    fn address(&self) -> &str;

    /// Returns the size of each object, in request order; 0 means absent
    async fn check_objects(&self, digests: &[Digest]) -> anyhow::Result<Vec<u64>>;

    /// Opens one object for streaming
    async fn get_object(&self, digest: &Digest) -> anyhow::Result<FetchedObject>;
}

/// Creates object server clients for addresses named in Fetch requests
pub trait IObjectServerConnector: Send + Sync {
    fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn IObjectServer>>;
}
