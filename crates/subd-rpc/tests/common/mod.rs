//! Shared fixtures for the protocol tests
//!
//! A [`Sub`] is a complete agent over a temporary root: object cache,
//! background scanner, protocol service and a recording trigger runner.
//! [`object_server`] mounts a wiremock object server holding given blobs.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use subd_cache::ObjectCache;
use subd_core::config::{scan_filter_with, SafetyConfig};
use subd_core::domain::{
    Digest, DirectoryInode, Inode, Mtime, RegularInode, Trigger, TriggerAction, TreeBuilder,
    S_IFDIR, S_IFREG,
};
use subd_core::ports::IServiceRunner;
use subd_rpc::messages::PollRequest;
use subd_rpc::{HttpObjectServerConnector, ServiceSettings, SubService};
use subd_scanner::{RateLimiter, ScanDaemon, ScanSettings};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Trigger runner
// ============================================================================

#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(TriggerAction, Vec<String>)>>,
}

impl RecordingRunner {
    pub fn calls(&self) -> Vec<(TriggerAction, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IServiceRunner for RecordingRunner {
    async fn run(&self, triggers: &[Trigger], action: TriggerAction) -> bool {
        let services = triggers.iter().map(|t| t.service.clone()).collect();
        self.calls.lock().unwrap().push((action, services));
        false
    }
}

// ============================================================================
// Sub fixture
// ============================================================================

pub struct Options {
    pub safety: SafetyConfig,
    /// Measured link speed; 0 leaves the fetcher uncalibrated
    pub network_speed: u64,
    pub benchmark_threshold_bytes: u64,
    /// Start the background scan loop
    pub run_scanner: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            safety: SafetyConfig::default(),
            network_speed: 1 << 30,
            benchmark_threshold_bytes: u64::MAX,
            run_scanner: true,
        }
    }
}

pub struct Sub {
    _tmp: TempDir,
    pub root: PathBuf,
    pub cache: ObjectCache,
    pub service: SubService,
    pub net_rate: Arc<RateLimiter>,
    pub runner: Arc<RecordingRunner>,
    pub settings: ServiceSettings,
    pub uid: u32,
    pub gid: u32,
}

impl Sub {
    pub async fn start(options: Options) -> Self {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("motd"), b"welcome\n").unwrap();
        let cache = ObjectCache::open(root.join(".subd/objects")).unwrap();

        let settings = ServiceSettings {
            root: root.clone(),
            work_dir: "/.subd".into(),
            triggers_file: root.join(".subd/triggers.json"),
            netbench_file: root.join(".subd/netbench"),
            fetch_concurrency: 2,
            benchmark_threshold_bytes: options.benchmark_threshold_bytes,
            safety: options.safety,
        };
        let scan_settings = ScanSettings {
            root: root.clone(),
            interval: Duration::from_secs(3600),
            one_file_system: true,
        };
        let disk_rate = Arc::new(RateLimiter::new("disk", 0, 100));
        let filter = scan_filter_with("/.subd", &[]).unwrap();
        let (daemon, scanner) = ScanDaemon::new(scan_settings, filter, cache.clone(), disk_rate);
        if options.run_scanner {
            tokio::spawn(daemon.run());
        }

        let net_rate = Arc::new(RateLimiter::new("network", options.network_speed, 100));
        let runner = Arc::new(RecordingRunner::default());
        let service = SubService::new(
            settings.clone(),
            scanner,
            cache.clone(),
            Arc::clone(&net_rate),
            Arc::new(HttpObjectServerConnector::new(Duration::from_secs(10))),
            runner.clone(),
            Vec::new(),
        );

        let meta = fs::metadata(&root).unwrap();
        let sub = Self {
            _tmp: tmp,
            root,
            cache,
            service,
            net_rate,
            runner,
            settings,
            uid: meta.uid(),
            gid: meta.gid(),
        };
        if options.run_scanner {
            sub.wait_for_scan().await;
        }
        sub
    }

    /// Polls until at least one scan has completed.
    pub async fn wait_for_scan(&self) {
        for _ in 0..500 {
            if self.service.poll(PollRequest::default()).scan_count > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scanner never completed a scan");
    }

    /// Polls until neither Fetch nor Update is running.
    pub async fn wait_idle(&self) {
        for _ in 0..500 {
            let poll = self.service.poll(PollRequest {
                short_poll_only: true,
                ..PollRequest::default()
            });
            if !poll.fetch_in_progress && !poll.update_in_progress {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operation never finished");
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    pub fn builder(&self) -> TreeBuilder {
        let root = fs::metadata(&self.root).unwrap();
        TreeBuilder::new(DirectoryInode {
            mode: S_IFDIR | (root.mode() & 0o7777),
            uid: self.uid,
            gid: self.gid,
            entries: Vec::new(),
        })
    }

    pub fn file(&self, content: &[u8]) -> Inode {
        Inode::Regular(RegularInode {
            mode: S_IFREG | 0o644,
            uid: self.uid,
            gid: self.gid,
            mtime: Mtime::new(1_600_000_000, 0),
            size: content.len() as u64,
            digest: Digest::of(content),
        })
    }

    pub fn dir(&self) -> Inode {
        Inode::Directory(DirectoryInode {
            mode: S_IFDIR | 0o755,
            uid: self.uid,
            gid: self.gid,
            entries: Vec::new(),
        })
    }
}

// ============================================================================
// Object server
// ============================================================================

/// Starts an object server holding `objects`, answering after `delay`.
pub async fn object_server(objects: &[&[u8]], delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    for content in objects {
        Mock::given(method("GET"))
            .and(path(format!("/objects/{}", Digest::of(content).to_hex())))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(content.to_vec())
                    .set_delay(delay),
            )
            .mount(&server)
            .await;
    }
    let sizes: Vec<u64> = objects.iter().map(|c| c.len() as u64).collect();
    Mock::given(method("POST"))
        .and(path("/check_objects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "sizes": sizes })))
        .mount(&server)
        .await;
    server
}

pub fn digests(objects: &[&[u8]]) -> Vec<Digest> {
    objects.iter().map(|c| Digest::of(c)).collect()
}

pub fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}
