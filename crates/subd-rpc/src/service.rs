//! Reconciliation protocol service
//!
//! [`SubService`] owns the [`ReconciliationState`] and implements every
//! protocol operation independently of the transport:
//!
//! | Operation | Waits on long work | Rejected when |
//! |-----------|--------------------|---------------|
//! | Poll | never | never |
//! | Fetch | only with `wait` | busy, read-only |
//! | Update | only with `wait` | busy, read-only, updates disabled, no scan yet |
//! | Cleanup | no | busy |
//! | Get/SetConfiguration | no | invalid values |
//! | GetFiles | streams | never (per-file errors are in-band) |
//!
//! Fetch and Update bodies run as detached tasks. Each claims the state
//! under its mutex before spawning and releases it when done, whatever the
//! outcome. The background scanner is paused for the duration of both.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use subd_cache::ObjectCache;
use subd_core::config::{scan_filter_with, Config, SafetyConfig};
use subd_core::domain::{
    load_triggers, resolve_under_root, ChangeSet, Digest, ReconciliationState,
};
use subd_core::ports::{IObjectServer, IObjectServerConnector, IServiceRunner};
use subd_reconcile::UpdateApplier;
use subd_scanner::rate_limit::format_bytes_per_second;
use subd_scanner::{RateLimiter, ScanPause, ScannerHandle};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::RpcError;
use crate::messages::{
    Ack, CleanupRequest, CleanupResponse, Configuration, FetchRequest, GetFileResponse,
    GetFilesRequest, PollRequest, PollResponse, UpdateRequest,
};
use crate::netbench::save_netbench;

/// Read size for GetFiles content
const FILE_CHUNK_LEN: usize = 64 * 1024;

/// Stream of GetFiles output: header lines and file content
pub type FileStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

// ============================================================================
// Settings
// ============================================================================

/// Static settings of the protocol service
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Host directory treated as `/`
    pub root: PathBuf,
    /// Managed pathname of the private working directory
    pub work_dir: String,
    pub triggers_file: PathBuf,
    pub netbench_file: PathBuf,
    pub fetch_concurrency: usize,
    /// A fetch larger than this with no measured link speed runs as a benchmark
    pub benchmark_threshold_bytes: u64,
    pub safety: SafetyConfig,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.scanner.root_dir.clone(),
            work_dir: config.storage.work_dir.clone(),
            triggers_file: config.triggers_file(),
            netbench_file: config.netbench_file(),
            fetch_concurrency: config.network.fetch_concurrency.max(1),
            benchmark_threshold_bytes: config.network.benchmark_threshold_mb << 20,
            safety: config.safety.clone(),
        }
    }
}

// ============================================================================
// SubService
// ============================================================================

struct ServiceInner {
    settings: ServiceSettings,
    state: Mutex<ReconciliationState>,
    scanner: ScannerHandle,
    cache: ObjectCache,
    net_rate: Arc<RateLimiter>,
    connector: Arc<dyn IObjectServerConnector>,
    runner: Arc<dyn IServiceRunner>,
    applier: UpdateApplier,
    exclusions: RwLock<Vec<String>>,
    get_files_lock: Arc<tokio::sync::Mutex<()>>,
    start_time: DateTime<Utc>,
}

/// The Sub side of the reconciliation protocol. Cheap to clone.
#[derive(Clone)]
pub struct SubService {
    inner: Arc<ServiceInner>,
}

impl SubService {
    pub fn new(
        settings: ServiceSettings,
        scanner: ScannerHandle,
        cache: ObjectCache,
        net_rate: Arc<RateLimiter>,
        connector: Arc<dyn IObjectServerConnector>,
        runner: Arc<dyn IServiceRunner>,
        exclusions: Vec<String>,
    ) -> Self {
        let applier = UpdateApplier::new(
            &settings.root,
            settings.work_dir.clone(),
            cache.clone(),
            &settings.triggers_file,
        );
        Self {
            inner: Arc::new(ServiceInner {
                settings,
                state: Mutex::new(ReconciliationState::new()),
                scanner,
                cache,
                net_rate,
                connector,
                runner,
                applier,
                exclusions: RwLock::new(exclusions),
                get_files_lock: Arc::new(tokio::sync::Mutex::new(())),
                start_time: Utc::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReconciliationState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current reconciliation state
    pub fn reconciliation_state(&self) -> ReconciliationState {
        self.state().clone()
    }

    // ------------------------------------------------------------------------
    // Poll
    // ------------------------------------------------------------------------

    /// Reports status. Never waits on a running Fetch or Update.
    pub fn poll(&self, request: PollRequest) -> PollResponse {
        let state = self.reconciliation_state();
        let snapshot = self.inner.scanner.snapshot();
        let follows = snapshot.has_scanned()
            && !request.short_poll_only
            && request.have_generation != snapshot.generation_count;
        let (total_data_bytes, num_regular_inodes) = snapshot
            .tree
            .as_ref()
            .map(|tree| (tree.total_data_bytes(), tree.num_regular_inodes() as u64))
            .unwrap_or_default();
        debug!(
            have = request.have_generation,
            generation = snapshot.generation_count,
            follows,
            "Poll"
        );

        PollResponse {
            network_speed: self.inner.net_rate.max_bytes_per_second(),
            fetch_in_progress: state.fetch_in_progress(),
            update_in_progress: state.update_in_progress(),
            last_fetch_error: state.last_fetch_error().map(str::to_owned),
            last_update_error: state.last_update_error().map(str::to_owned),
            last_update_had_trigger_failures: state.last_update_had_trigger_failures(),
            last_successful_image_name: state.last_successful_image_name().map(str::to_owned),
            start_time: self.inner.start_time,
            poll_time: Utc::now(),
            scan_count: snapshot.scan_count,
            generation_count: snapshot.generation_count,
            last_scan_time: snapshot.last_scan_at,
            last_change_time: snapshot.last_change_at,
            total_data_bytes,
            num_regular_inodes,
            file_system_follows: follows,
            tree: if follows { snapshot.tree } else { None },
            object_cache: follows.then_some(snapshot.object_cache),
        }
    }

    // ------------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------------

    /// Starts downloading `digests` into the object cache.
    pub async fn fetch(&self, request: FetchRequest) -> Result<Ack, RpcError> {
        if self.inner.settings.safety.read_only {
            return Err(RpcError::ReadOnly);
        }
        self.state().begin_fetch()?;
        info!(
            objects = request.digests.len(),
            server = %request.server_address,
            "Fetch started"
        );

        let server = match self.inner.connector.connect(&request.server_address) {
            Ok(server) => server,
            Err(e) => {
                let message = format!("{e:#}");
                self.finish_fetch(Some(message.clone()));
                return Err(RpcError::InvalidRequest(message));
            }
        };

        let service = self.clone();
        let digests = request.digests;
        let task = tokio::spawn(async move { service.run_fetch(server, digests).await });
        if !request.wait {
            return Ok(Ack {});
        }
        match task.await {
            Ok(None) => Ok(Ack {}),
            Ok(Some(error)) => Err(RpcError::Failed(error)),
            Err(e) => Err(RpcError::Internal(e.to_string())),
        }
    }

    /// Fetch body. Returns the error recorded for Poll.
    async fn run_fetch(self, server: Arc<dyn IObjectServer>, digests: Vec<Digest>) -> Option<String> {
        let pause = self.pause_scanner().await;
        let result = self.fetch_objects(server.as_ref(), &digests).await;
        if let Err(e) = self.inner.scanner.rescan_object_cache().await {
            warn!(error = %e, "Failed to rescan object cache after fetch");
        }
        drop(pause);

        let error = result.err().map(|e| format!("{e:#}"));
        if let Some(error) = &error {
            warn!(error = %error, "Fetch finished with errors");
        }
        self.finish_fetch(error.clone());
        error
    }

    fn finish_fetch(&self, error: Option<String>) {
        if let Err(e) = self.state().finish_fetch(error) {
            warn!(error = %e, "Fetch completion out of order");
        }
    }

    #[instrument(skip_all, fields(server = server.address(), objects = digests.len()))]
    async fn fetch_objects(&self, server: &dyn IObjectServer, digests: &[Digest]) -> anyhow::Result<()> {
        let net_rate = &self.inner.net_rate;
        if !net_rate.is_calibrated() && self.enough_bytes_for_benchmark(server, digests).await {
            return self.benchmark_fetch(server, digests).await;
        }

        let started = Instant::now();
        let fetches: Vec<_> = digests.iter().map(|digest| self.fetch_one(server, digest, Some(net_rate))).collect();
        let results: Vec<anyhow::Result<u64>> = stream::iter(fetches)
            .buffer_unordered(self.inner.settings.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut total = 0;
        let mut failed = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(bytes) => total += bytes,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Object fetch failed");
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }
        info!(
            bytes = total,
            speed = %format_bytes_per_second(speed(total, started.elapsed())),
            failed,
            "Fetch complete"
        );
        match last_error {
            Some(e) => Err(e.context(format!("{failed} of {} objects failed", digests.len()))),
            None => Ok(()),
        }
    }

    async fn enough_bytes_for_benchmark(&self, server: &dyn IObjectServer, digests: &[Digest]) -> bool {
        match server.check_objects(digests).await {
            Ok(sizes) => sizes.iter().sum::<u64>() > self.inner.settings.benchmark_threshold_bytes,
            Err(e) => {
                debug!(error = %format!("{e:#}"), "Cannot size fetch for benchmarking");
                false
            }
        }
    }

    /// Fetches one object at a time at full speed and records the link speed.
    async fn benchmark_fetch(&self, server: &dyn IObjectServer, digests: &[Digest]) -> anyhow::Result<()> {
        info!("Benchmarking network speed");
        let started = Instant::now();
        let mut total = 0;
        for digest in digests {
            total += self.fetch_one(server, digest, None).await?;
        }
        let bytes_per_second = speed(total, started.elapsed());
        if bytes_per_second == 0 {
            return Ok(());
        }
        self.inner.net_rate.set_max_bytes_per_second(bytes_per_second);
        if let Err(e) = save_netbench(&self.inner.settings.netbench_file, bytes_per_second) {
            warn!(error = %format!("{e:#}"), "Failed to save network benchmark");
        }
        info!(
            speed = %format_bytes_per_second(bytes_per_second),
            "Benchmarked network speed"
        );
        Ok(())
    }

    /// Streams one object into the cache. Returns the bytes downloaded.
    async fn fetch_one(
        &self,
        server: &dyn IObjectServer,
        digest: &Digest,
        rate: Option<&RateLimiter>,
    ) -> anyhow::Result<u64> {
        if self.inner.cache.has(digest) {
            debug!(%digest, "Object already cached");
            return Ok(0);
        }
        let mut object = server.get_object(digest).await?;
        let mut writer = self.inner.cache.writer(digest, object.size)?;
        while let Some(chunk) = object.chunks.next().await {
            let chunk = chunk.with_context(|| format!("Failed reading object {digest}"))?;
            if let Some(rate) = rate {
                rate.pace(chunk.len() as u64).await;
            }
            writer.write_chunk(&chunk)?;
        }
        Ok(writer.commit()?)
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// Starts applying a change set.
    pub async fn update(&self, request: UpdateRequest) -> Result<Ack, RpcError> {
        let safety = &self.inner.settings.safety;
        if safety.read_only {
            return Err(RpcError::ReadOnly);
        }
        if safety.disable_updates {
            return Err(RpcError::UpdatesDisabled);
        }
        if !self.inner.scanner.snapshot().has_scanned() {
            return Err(RpcError::NoScanYet);
        }
        self.state().begin_update()?;
        info!(
            image = %request.change_set.image_name,
            operations = request.change_set.operation_count(),
            "Update started"
        );

        let service = self.clone();
        let task = tokio::spawn(async move { service.run_update(request.change_set).await });
        if !request.wait {
            return Ok(Ack {});
        }
        match task.await {
            Ok(None) => Ok(Ack {}),
            Ok(Some(error)) => Err(RpcError::Failed(error)),
            Err(e) => Err(RpcError::Internal(e.to_string())),
        }
    }

    /// Update body. Returns the error recorded for Poll.
    async fn run_update(self, change_set: ChangeSet) -> Option<String> {
        let image_name = change_set.image_name.clone();
        let previous = load_triggers(&self.inner.settings.triggers_file).unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "Ignoring unreadable saved triggers");
            Vec::new()
        });

        let pause = self.pause_scanner().await;
        let outcome = self
            .inner
            .applier
            .apply(change_set, &previous, self.inner.runner.as_ref())
            .await;
        if let Err(e) = self.inner.scanner.rescan_object_cache().await {
            warn!(error = %e, "Failed to rescan object cache after update");
        }
        drop(pause);

        let result = self.state().finish_update(
            &image_name,
            outcome.last_error.clone(),
            outcome.had_trigger_failures,
        );
        if let Err(e) = result {
            warn!(error = %e, "Update completion out of order");
        }
        outcome.last_error
    }

    // ------------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------------

    /// Deletes objects from the cache.
    pub async fn cleanup(&self, request: CleanupRequest) -> Result<CleanupResponse, RpcError> {
        self.state().ensure_idle()?;
        let pause = self.pause_scanner().await;

        let removed = {
            // Holding the state lock keeps a Fetch or Update from starting.
            let state = self.state();
            state.ensure_idle()?;
            info!(objects = request.digests.len(), "Cleanup");
            let mut removed = 0;
            for digest in &request.digests {
                match self.inner.cache.remove(digest) {
                    Ok(true) => removed += 1,
                    Ok(false) => debug!(%digest, "Object already absent"),
                    Err(e) => warn!(%digest, error = %e, "Failed to remove object"),
                }
            }
            removed
        };

        if let Err(e) = self.inner.scanner.rescan_object_cache().await {
            warn!(error = %e, "Failed to rescan object cache after cleanup");
        }
        drop(pause);
        Ok(CleanupResponse { removed })
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn get_configuration(&self) -> Configuration {
        Configuration {
            scan_speed_percent: self.inner.scanner.rate_limiter().speed_percent(),
            network_speed_percent: self.inner.net_rate.speed_percent(),
            scan_exclusions: self
                .inner
                .exclusions
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Applies new speed limits and scan exclusions.
    ///
    /// A speed of 0 leaves that limit unchanged. Nothing is applied if any
    /// value is invalid.
    pub fn set_configuration(&self, config: Configuration) -> Result<Ack, RpcError> {
        for (name, percent) in [
            ("scan_speed_percent", config.scan_speed_percent),
            ("network_speed_percent", config.network_speed_percent),
        ] {
            if percent > 100 {
                return Err(RpcError::InvalidRequest(format!(
                    "{name} must be at most 100, got {percent}"
                )));
            }
        }
        let filter = scan_filter_with(&self.inner.settings.work_dir, &config.scan_exclusions)
            .map_err(|e| RpcError::InvalidRequest(e.to_string()))?;

        if config.scan_speed_percent > 0 {
            self.inner
                .scanner
                .rate_limiter()
                .set_speed_percent(config.scan_speed_percent);
        }
        if config.network_speed_percent > 0 {
            self.inner.net_rate.set_speed_percent(config.network_speed_percent);
        }
        self.inner.scanner.set_filter(filter);
        *self
            .inner
            .exclusions
            .write()
            .unwrap_or_else(|e| e.into_inner()) = config.scan_exclusions;
        info!("Configuration updated");
        Ok(Ack {})
    }

    // ------------------------------------------------------------------------
    // GetFiles
    // ------------------------------------------------------------------------

    /// Streams the named files.
    ///
    /// Each file is preceded by a JSON [`GetFileResponse`] line. Only one
    /// GetFiles stream runs at a time.
    pub async fn get_files(&self, request: GetFilesRequest) -> FileStream {
        let guard = Arc::clone(&self.inner.get_files_lock).lock_owned().await;
        let (tx, rx) = mpsc::channel(4);
        let root = self.inner.settings.root.clone();
        tokio::spawn(async move {
            let _guard = guard;
            send_files(root, request.paths, tx).await;
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    async fn pause_scanner(&self) -> Option<ScanPause> {
        match self.inner.scanner.pause().await {
            Ok(pause) => Some(pause),
            Err(e) => {
                warn!(error = %e, "Scanner did not acknowledge pause");
                None
            }
        }
    }
}

fn speed(bytes: u64, elapsed: Duration) -> u64 {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return 0;
    }
    u64::try_from(u128::from(bytes) * 1_000_000_000 / nanos).unwrap_or(u64::MAX)
}

// ============================================================================
// GetFiles streaming
// ============================================================================

type FileSender = mpsc::Sender<std::io::Result<Vec<u8>>>;

async fn send_files(root: PathBuf, paths: Vec<String>, tx: FileSender) {
    let count = paths.len();
    for path in &paths {
        if !send_file(&root, path, &tx).await {
            debug!("GetFiles receiver went away");
            return;
        }
    }
    info!(files = count, "GetFiles complete");
}

async fn open_file(root: &std::path::Path, path: &str) -> anyhow::Result<(tokio::fs::File, u64)> {
    let host_path = resolve_under_root(root, path)?;
    let file = tokio::fs::File::open(&host_path)
        .await
        .with_context(|| format!("open {path}"))?;
    let metadata = file.metadata().await.with_context(|| format!("stat {path}"))?;
    if !metadata.is_file() {
        return Err(anyhow!("{path} is not a regular file"));
    }
    Ok((file, metadata.len()))
}

/// Sends one header line and its content. Returns false once the receiver
/// is gone or the stream is broken.
async fn send_file(root: &std::path::Path, path: &str, tx: &FileSender) -> bool {
    let (header, file) = match open_file(root, path).await {
        Ok((file, size)) => (GetFileResponse { error: None, size }, Some((file, size))),
        Err(e) => (
            GetFileResponse {
                error: Some(format!("{e:#}")),
                size: 0,
            },
            None,
        ),
    };
    let mut line = match serde_json::to_vec(&header) {
        Ok(line) => line,
        Err(e) => {
            let _ = tx.send(Err(std::io::Error::other(e))).await;
            return false;
        }
    };
    line.push(b'\n');
    if tx.send(Ok(line)).await.is_err() {
        return false;
    }
    let Some((file, size)) = file else {
        return true;
    };

    let mut reader = file.take(size);
    let mut sent = 0;
    loop {
        let mut buffer = vec![0; FILE_CHUNK_LEN];
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return false;
            }
        };
        buffer.truncate(n);
        sent += n as u64;
        if tx.send(Ok(buffer)).await.is_err() {
            return false;
        }
    }
    if sent < size {
        // The file shrank after its size was announced.
        let _ = tx
            .send(Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{path} shrank while being sent"),
            )))
            .await;
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed() {
        assert_eq!(speed(1000, Duration::from_secs(2)), 500);
        assert_eq!(speed(1000, Duration::ZERO), 0);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.scanner.root_dir = PathBuf::from("/srv/root");
        config.network.benchmark_threshold_mb = 2;
        config.network.fetch_concurrency = 0;
        let settings = ServiceSettings::from_config(&config);
        assert_eq!(settings.benchmark_threshold_bytes, 2 * 1024 * 1024);
        assert_eq!(settings.fetch_concurrency, 1);
        assert_eq!(settings.work_dir, "/.subd");
        assert_eq!(settings.netbench_file, PathBuf::from("/srv/root/.subd/netbench"));
    }
}
