//! Background scan loop
//!
//! [`ScanDaemon`] rescans the managed root on a fixed interval and records
//! each result in the shared [`FileSystemHistory`]. Other tasks talk to it
//! through a cloneable [`ScannerHandle`]:
//!
//! ```text
//! ┌──────────────┐   Disable{ack}    ┌──────────────┐
//! │ Fetch/Update │ ────────────────► │  ScanDaemon  │
//! │   (handle)   │ ◄──────────────── │  (one task)  │
//! └──────────────┘       ack         └──────────────┘
//! ```
//!
//! A disable request first raises a shared hold count, which the running
//! scan polls between files, then waits for the loop to acknowledge. Once
//! the acknowledgement arrives no scan is running and none will start until
//! every holder has enabled the scanner again.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use subd_cache::ObjectCache;
use subd_core::domain::{Filter, ObjectCacheState};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::history::{FileSystemHistory, HistorySnapshot};
use crate::rate_limit::{RateLimiter, CHUNK_LEN};
use crate::walk::{scan_with_options, ScanOptions, ScanOutcome, ScanResult};

/// Bound on queued scanner commands
const COMMAND_QUEUE_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Host directory treated as `/`
    pub root: PathBuf,
    /// Pause between the end of one scan and the start of the next
    pub interval: Duration,
    pub one_file_system: bool,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug)]
enum ScannerCommand {
    Disable { ack: oneshot::Sender<()> },
    Enable,
    RescanObjectCache { ack: oneshot::Sender<Result<bool, ScanError>> },
}

// ============================================================================
// ScannerHandle
// ============================================================================

/// Cloneable access to the scan loop and its results.
#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::Sender<ScannerCommand>,
    holds: Arc<AtomicUsize>,
    history: Arc<RwLock<FileSystemHistory>>,
    filter: Arc<RwLock<Filter>>,
    rate: Arc<RateLimiter>,
}

impl ScannerHandle {
    /// Takes one hold on the scanner and waits until no scan is running.
    ///
    /// Every successful call must be matched by one [`enable`](Self::enable).
    pub async fn disable(&self) -> Result<(), ScanError> {
        self.pause().await?.keep();
        Ok(())
    }

    /// Releases one hold. Scanning resumes once no hold remains.
    pub async fn enable(&self) -> Result<(), ScanError> {
        if self.release() {
            self.tx
                .send(ScannerCommand::Enable)
                .await
                .map_err(|_| ScanError::Stopped)?;
        }
        Ok(())
    }

    /// Drops one hold; true if it was the last.
    fn release(&self) -> bool {
        let previous = self
            .holds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        matches!(previous, Ok(1))
    }

    /// Disables the scanner until the returned guard is dropped.
    pub async fn pause(&self) -> Result<ScanPause, ScanError> {
        self.holds.fetch_add(1, Ordering::SeqCst);
        // Released on error or if this future is dropped before the ack.
        let pause = ScanPause {
            handle: Some(self.clone()),
        };
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ScannerCommand::Disable { ack })
            .await
            .map_err(|_| ScanError::Stopped)?;
        rx.await.map_err(|_| ScanError::Stopped)?;
        Ok(pause)
    }

    /// Re-reads the object cache directory into the history.
    ///
    /// Returns true if the generation moved.
    pub async fn rescan_object_cache(&self) -> Result<bool, ScanError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ScannerCommand::RescanObjectCache { ack })
            .await
            .map_err(|_| ScanError::Stopped)?;
        rx.await.map_err(|_| ScanError::Stopped)?
    }

    pub fn is_disabled(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        read_lock(&self.history).snapshot()
    }

    /// Replaces the exclusion filter used by subsequent scans.
    pub fn set_filter(&self, filter: Filter) {
        info!(lines = filter.lines().len(), "Scan filter replaced");
        *self.filter.write().unwrap_or_else(|e| e.into_inner()) = filter;
    }

    pub fn filter(&self) -> Filter {
        read_lock(&self.filter).clone()
    }

    /// Limiter pacing filesystem reads
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate
    }
}

/// Keeps one hold on the scanner while alive.
pub struct ScanPause {
    handle: Option<ScannerHandle>,
}

impl ScanPause {
    /// Leaves the hold in place; a later [`ScannerHandle::enable`] releases it.
    fn keep(mut self) {
        self.handle = None;
    }
}

impl Drop for ScanPause {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.release() && handle.tx.try_send(ScannerCommand::Enable).is_err() {
            // A full queue wakes the loop anyway, and it re-reads the hold
            // count on every iteration.
            debug!("Scanner enable not queued");
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// ScanDaemon
// ============================================================================

pub struct ScanDaemon {
    rx: mpsc::Receiver<ScannerCommand>,
    settings: ScanSettings,
    cache: ObjectCache,
    holds: Arc<AtomicUsize>,
    history: Arc<RwLock<FileSystemHistory>>,
    filter: Arc<RwLock<Filter>>,
    rate: Arc<RateLimiter>,
}

impl ScanDaemon {
    /// Creates the loop and its handle. The caller spawns [`ScanDaemon::run`].
    pub fn new(
        settings: ScanSettings,
        filter: Filter,
        cache: ObjectCache,
        rate: Arc<RateLimiter>,
    ) -> (Self, ScannerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let holds = Arc::new(AtomicUsize::new(0));
        let history = Arc::new(RwLock::new(FileSystemHistory::new()));
        let filter = Arc::new(RwLock::new(filter));
        let handle = ScannerHandle {
            tx,
            holds: Arc::clone(&holds),
            history: Arc::clone(&history),
            filter: Arc::clone(&filter),
            rate: Arc::clone(&rate),
        };
        let daemon = Self {
            rx,
            settings,
            cache,
            holds,
            history,
            filter,
            rate,
        };
        (daemon, handle)
    }

    /// Runs until every handle has been dropped.
    pub async fn run(mut self) {
        info!(
            root = %self.settings.root.display(),
            interval_secs = self.settings.interval.as_secs(),
            "Scanner started"
        );
        let mut next_scan = Instant::now();
        loop {
            let enabled = !self.is_held();
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(next_scan), if enabled => {
                    if !self.is_held() {
                        self.scan_once().await;
                    }
                    next_scan = Instant::now() + self.settings.interval;
                }
            }
        }
        info!("Scanner stopped");
    }

    fn is_held(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }

    async fn handle_command(&mut self, command: ScannerCommand) {
        match command {
            ScannerCommand::Disable { ack } => {
                debug!(holds = self.holds.load(Ordering::SeqCst), "Scanner disabled");
                let _ = ack.send(());
            }
            ScannerCommand::Enable => {
                debug!("Scanner enabled");
            }
            ScannerCommand::RescanObjectCache { ack } => {
                let result = self.rescan_object_cache().await;
                let _ = ack.send(result);
            }
        }
    }

    async fn rescan_object_cache(&self) -> Result<bool, ScanError> {
        let cache = self.cache.clone();
        let state = tokio::task::spawn_blocking(move || cache.scan())
            .await
            .map_err(|_| ScanError::Stopped)??;
        let changed = self
            .history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .update_object_cache_only(state);
        Ok(changed)
    }

    async fn scan_once(&self) {
        let root = self.settings.root.clone();
        let options = ScanOptions {
            one_file_system: self.settings.one_file_system,
        };
        let filter = read_lock(&self.filter).clone();
        let rate = Arc::clone(&self.rate);
        let holds = Arc::clone(&self.holds);
        let cache = self.cache.clone();
        let calibrating = !rate.is_calibrated();

        let joined = tokio::task::spawn_blocking(move || {
            let cancel = || holds.load(Ordering::SeqCst) > 0;
            let outcome = scan_with_options(&root, &filter, &rate, options, &cancel)?;
            let ScanOutcome::Complete(result) = outcome else {
                return Ok(None);
            };
            // Nothing writes to the cache unless the scanner is held.
            let object_cache = if cancel() {
                cache.scan()?
            } else {
                cache.scan_and_reclaim()?
            };
            Ok::<Option<(ScanResult, ObjectCacheState)>, ScanError>(Some((result, object_cache)))
        })
        .await;

        let (result, object_cache) = match joined {
            Ok(Ok(Some(done))) => done,
            Ok(Ok(None)) => {
                debug!("Scan interrupted by disable request");
                return;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Scan failed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Scan task panicked");
                return;
            }
        };

        if calibrating {
            self.calibrate(&result);
        }
        let paths = result.tree.path_count();
        let changed = self
            .history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .update_timed(result.tree, object_cache, result.duration);
        debug!(
            paths,
            bytes_read = result.bytes_read,
            elapsed_ms = result.duration.as_millis() as u64,
            changed,
            "Scan recorded"
        );
    }

    /// Sets the disk capacity from an unthrottled scan that read enough data.
    fn calibrate(&self, result: &ScanResult) {
        let nanos = result.duration.as_nanos();
        if result.bytes_read < CHUNK_LEN || nanos == 0 {
            return;
        }
        let bytes_per_second = u128::from(result.bytes_read) * 1_000_000_000 / nanos;
        self.rate
            .set_max_bytes_per_second(u64::try_from(bytes_per_second).unwrap_or(u64::MAX));
        info!(limiter = %self.rate, "Disk speed measured from first scan");
    }
}
