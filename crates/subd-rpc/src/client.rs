//! Object server HTTP client
//!
//! Implements [`IObjectServer`] against the object server's HTTP surface:
//!
//! - `POST /check_objects` with `{"digests": [...]}` returns
//!   `{"sizes": [...]}` in request order, 0 for absent objects
//! - `GET /objects/<hex digest>` streams one object, announcing its length
//!   in `Content-Length`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use subd_core::domain::Digest;
use subd_core::ports::{FetchedObject, IObjectServer, IObjectServerConnector};
use tracing::debug;

/// Timeout for establishing a connection to an object server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CheckObjectsRequest<'a> {
    digests: &'a [Digest],
}

#[derive(Debug, Deserialize)]
struct CheckObjectsResponse {
    sizes: Vec<u64>,
}

// ============================================================================
// ObjectServerClient
// ============================================================================

/// HTTP client for one object server
pub struct ObjectServerClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ObjectServerClient {
    /// Creates a client for `address` (`host:port` or a full URL)
    pub fn new(address: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        };
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    /// Creates a client with a custom base URL (useful for testing)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl IObjectServer for ObjectServerClient {
    fn address(&self) -> &str {
        &self.base_url
    }

    async fn check_objects(&self, digests: &[Digest]) -> Result<Vec<u64>> {
        let response = self
            .client
            .post(self.url("/check_objects"))
            .timeout(self.request_timeout)
            .json(&CheckObjectsRequest { digests })
            .send()
            .await
            .with_context(|| format!("Failed to reach object server {}", self.base_url))?
            .error_for_status()
            .context("Object server rejected check_objects")?;
        let body: CheckObjectsResponse = response
            .json()
            .await
            .context("Failed to parse check_objects response")?;
        if body.sizes.len() != digests.len() {
            bail!(
                "check_objects returned {} sizes for {} digests",
                body.sizes.len(),
                digests.len()
            );
        }
        Ok(body.sizes)
    }

    async fn get_object(&self, digest: &Digest) -> Result<FetchedObject> {
        let url = self.url(&format!("/objects/{}", digest.to_hex()));
        debug!(%digest, "Requesting object");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach object server {}", self.base_url))?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("object {digest} not found on {}", self.base_url);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("Object server rejected request for {digest}"))?;
        let size = response
            .content_length()
            .with_context(|| format!("Object server sent {digest} without a length"))?;
        let chunks = response
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(anyhow::Error::from)
            .boxed();
        Ok(FetchedObject { size, chunks })
    }
}

// ============================================================================
// HttpObjectServerConnector
// ============================================================================

/// Builds an [`ObjectServerClient`] for each Fetch request
#[derive(Debug, Clone)]
pub struct HttpObjectServerConnector {
    request_timeout: Duration,
}

impl HttpObjectServerConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl IObjectServerConnector for HttpObjectServerConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn IObjectServer>> {
        if address.trim().is_empty() {
            bail!("empty object server address");
        }
        Ok(Arc::new(ObjectServerClient::new(address, self.request_timeout)?))
    }
}
