//! HTTP transport tests
//!
//! Start an [`RpcServer`](subd_rpc::RpcServer) on an ephemeral port and talk
//! to it with reqwest.

mod common;

use std::time::Duration;

use common::{digests, object_server, Options, Sub};
use reqwest::StatusCode;
use serde_json::{json, Value};
use subd_core::domain::{FileSystemTree, ObjectCacheState};
use subd_rpc::messages::{Configuration, GetFileResponse, PollResponse};
use subd_rpc::RpcServer;
use tokio_util::sync::CancellationToken;

struct Served {
    sub: Sub,
    base: String,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl Drop for Served {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(options: Options) -> Served {
    let sub = Sub::start(options).await;
    let server = RpcServer::bind(sub.service.clone(), "127.0.0.1:0")
        .await
        .expect("Failed to bind RPC server");
    let base = format!("http://{}", server.local_addr());
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    Served {
        sub,
        base,
        client: reqwest::Client::new(),
        shutdown,
    }
}

impl Served {
    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .expect("request failed")
    }
}

#[tokio::test]
async fn test_poll_over_http() {
    let served = serve(Options::default()).await;

    let response = served.post("/v1/poll", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.unwrap();
    let lines: Vec<&[u8]> = body.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 3);
    let poll: PollResponse = serde_json::from_slice(lines[0]).unwrap();
    assert!(poll.file_system_follows);
    let summary: Value = serde_json::from_slice(lines[0]).unwrap();
    assert!(summary.get("tree").is_none());
    let tree: FileSystemTree = serde_json::from_slice(lines[1]).unwrap();
    assert!(tree.lookup("/motd").is_some());
    let object_cache: ObjectCacheState = serde_json::from_slice(lines[2]).unwrap();
    assert!(object_cache.is_empty());

    let response = served
        .post(
            "/v1/poll",
            json!({ "have_generation": poll.generation_count }),
        )
        .await;
    let body = response.bytes().await.unwrap();
    assert_eq!(body.iter().filter(|&&b| b == b'\n').count(), 1);
    let poll: PollResponse = serde_json::from_slice(&body).unwrap();
    assert!(!poll.file_system_follows);
}

#[tokio::test]
async fn test_configuration_over_http() {
    let served = serve(Options::default()).await;

    let response = served
        .post(
            "/v1/configuration",
            json!({
                "scan_speed_percent": 7,
                "network_speed_percent": 30,
                "scan_exclusions": ["/var/tmp/.*"]
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let config: Configuration = served
        .client
        .get(format!("{}/v1/configuration", served.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config.scan_speed_percent, 7);
    assert_eq!(config.network_speed_percent, 30);
    assert_eq!(config.scan_exclusions, vec!["/var/tmp/.*".to_string()]);
}

#[tokio::test]
async fn test_status_page_over_http() {
    let served = serve(Options::default()).await;

    let response = served.client.get(format!("{}/", served.base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/html; charset=utf-8"
    );
    let page = response.text().await.unwrap();
    assert!(page.contains("<title>subd status</title>"));
    assert!(page.contains("Scan count"));
    assert!(page.contains("Update in progress</th><td>false</td>"));

    let response = served.post("/", json!({})).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_busy_fetch_is_conflict() {
    let served = serve(Options::default()).await;
    let objects: &[&[u8]] = &[b"slow"];
    let server = object_server(objects, Duration::from_millis(300)).await;
    let body = json!({
        "server_address": server.uri(),
        "digests": digests(objects),
    });

    assert_eq!(served.post("/v1/fetch", body.clone()).await.status(), StatusCode::OK);
    let response = served.post("/v1/fetch", body).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["error"], "fetch already in progress");

    served.sub.wait_idle().await;
}

#[tokio::test]
async fn test_update_before_scan_is_unavailable() {
    let served = serve(Options {
        run_scanner: false,
        ..Options::default()
    })
    .await;
    let response = served
        .post("/v1/update", json!({ "change_set": { "image_name": "img" } }))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_bad_requests() {
    let served = serve(Options::default()).await;

    let response = served
        .client
        .post(format!("{}/v1/cleanup", served.base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = served
        .client
        .get(format!("{}/v1/poll", served.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = served
        .client
        .get(format!("{}/nowhere", served.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Splits a GetFiles body into (header, content) pairs.
fn parse_files(mut body: &[u8]) -> Vec<(GetFileResponse, Vec<u8>)> {
    let mut files = Vec::new();
    while !body.is_empty() {
        let end = body.iter().position(|&b| b == b'\n').expect("header line");
        let header: GetFileResponse = serde_json::from_slice(&body[..end]).unwrap();
        body = &body[end + 1..];
        let size = if header.error.is_some() { 0 } else { header.size as usize };
        files.push((header, body[..size].to_vec()));
        body = &body[size..];
    }
    files
}

#[tokio::test]
async fn test_get_files_streams_content_and_errors() {
    let served = serve(Options::default()).await;
    std::fs::write(served.sub.path("/big"), vec![7u8; 200_000]).unwrap();

    let response = served
        .post(
            "/v1/files",
            json!({ "paths": ["/motd", "/missing", "/../../etc/passwd", "/big"] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.unwrap();
    let files = parse_files(&body);

    assert_eq!(files.len(), 4);
    assert_eq!(files[0].0.size, 8);
    assert_eq!(files[0].1, b"welcome\n");
    assert!(files[1].0.error.is_some());
    assert!(files[2].0.error.is_some());
    assert_eq!(files[3].0.size, 200_000);
    assert!(files[3].1.iter().all(|&b| b == 7));
}
