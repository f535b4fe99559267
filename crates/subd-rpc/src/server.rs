//! HTTP transport for the reconciliation protocol
//!
//! | Method | Path | Body | Reply |
//! |--------|------|------|-------|
//! | POST | `/v1/poll` | [`PollRequest`] | summary line, then tree and object cache lines |
//! | POST | `/v1/fetch` | [`FetchRequest`] | `{}` |
//! | POST | `/v1/update` | [`UpdateRequest`] | `{}` |
//! | POST | `/v1/cleanup` | [`CleanupRequest`] | [`CleanupResponse`](crate::messages::CleanupResponse) |
//! | GET | `/v1/configuration` | | [`Configuration`] |
//! | POST | `/v1/configuration` | [`Configuration`] | `{}` |
//! | POST | `/v1/files` | [`GetFilesRequest`] | header line + content per file |
//! | GET | `/` | | HTML status page |
//!
//! A Poll reply is newline-delimited JSON: the [`PollResponse`] summary,
//! then, only when `file_system_follows` is set, the tree and the object
//! cache state on one line each. The summary is sent before the bulk data
//! is encoded.
//!
//! Failures carry an [`ErrorResponse`] body. A busy Sub answers
//! `409 Conflict`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use anyhow::Context;
use futures_util::{future, stream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::RpcError;
use crate::messages::{
    CleanupRequest, Configuration, ErrorResponse, FetchRequest, GetFilesRequest, PollRequest,
    PollResponse, UpdateRequest,
};
use crate::service::SubService;

type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// HTTP server exposing a [`SubService`].
pub struct RpcServer {
    service: SubService,
    listener: TcpListener,
    addr: SocketAddr,
}

impl RpcServer {
    /// Binds the listener, e.g. `"0.0.0.0:6969"`. Port 0 picks a free port.
    pub async fn bind(service: SubService, endpoint: &str) -> anyhow::Result<Self> {
        let addr: SocketAddr = endpoint
            .parse()
            .with_context(|| format!("Invalid listen address {endpoint}"))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let addr = listener.local_addr()?;
        Ok(Self {
            service,
            listener,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves requests until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %self.addr, "RPC server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, peer) = result?;
                    let io = TokioIo::new(stream);
                    let service = self.service.clone();

                    tokio::spawn(async move {
                        let handler = service_fn(move |req| handle_request(req, service.clone()));
                        if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                            error!(error = %e, %peer, "RPC connection error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    service: SubService,
) -> Result<Response<ResponseBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, path, "RPC request");

    let response = match (method, path.as_str()) {
        (Method::POST, "/v1/poll") => match read_json::<PollRequest>(req).await {
            Ok(request) => poll_response(service.poll(request)),
            Err(e) => error_response(&e),
        },
        (Method::POST, "/v1/fetch") => {
            call(req, |request: FetchRequest| service.fetch(request)).await
        }
        (Method::POST, "/v1/update") => {
            call(req, |request: UpdateRequest| service.update(request)).await
        }
        (Method::POST, "/v1/cleanup") => {
            call(req, |request: CleanupRequest| service.cleanup(request)).await
        }
        (Method::GET, "/v1/configuration") => {
            json_response(StatusCode::OK, &service.get_configuration())
        }
        (Method::POST, "/v1/configuration") => {
            call(req, |config: Configuration| async move {
                service.set_configuration(config)
            })
            .await
        }
        (Method::POST, "/v1/files") => match read_json::<GetFilesRequest>(req).await {
            Ok(request) => files_response(service.get_files(request).await),
            Err(e) => error_response(&e),
        },
        (Method::GET, "/") => {
            let status = service.poll(PollRequest {
                have_generation: 0,
                short_poll_only: true,
            });
            with_status(
                StatusCode::OK,
                full(status_page(&status)),
                "text/html; charset=utf-8",
            )
        }
        (_, "/" | "/v1/poll" | "/v1/fetch" | "/v1/update" | "/v1/cleanup" | "/v1/configuration" | "/v1/files") => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Decodes a JSON request, runs `op` and encodes its result.
async fn call<Req, Resp, F, Fut>(req: Request<Incoming>, op: F) -> Response<ResponseBody>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Resp, RpcError>>,
{
    let request = match read_json(req).await {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    match op(request).await {
        Ok(reply) => json_response(StatusCode::OK, &reply),
        Err(e) => error_response(&e),
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, RpcError> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| RpcError::InvalidRequest(format!("reading body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| RpcError::InvalidRequest(e.to_string()))
}

// ============================================================================
// Responses
// ============================================================================

fn status_for(error: &RpcError) -> StatusCode {
    match error {
        RpcError::Busy(_) => StatusCode::CONFLICT,
        RpcError::ReadOnly | RpcError::UpdatesDisabled => StatusCode::FORBIDDEN,
        RpcError::NoScanYet => StatusCode::SERVICE_UNAVAILABLE,
        RpcError::InvalidRequest(_) | RpcError::Domain(_) => StatusCode::BAD_REQUEST,
        RpcError::Failed(_) | RpcError::Cache(_) | RpcError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn with_status(status: StatusCode, body: ResponseBody, content_type: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => with_status(status, full(body), "application/json"),
        Err(e) => {
            error!(error = %e, "Failed to encode RPC response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response")
        }
    }
}

fn error_response(error: &RpcError) -> Response<ResponseBody> {
    let status = status_for(error);
    debug!(status = status.as_u16(), error = %error, "RPC request rejected");
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
        },
    )
}

fn text_response(status: StatusCode, text: &'static str) -> Response<ResponseBody> {
    with_status(status, full(text), "text/plain; charset=utf-8")
}

fn encode_line<T: Serialize + ?Sized>(value: &T) -> std::io::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

fn poll_response(mut reply: PollResponse) -> Response<ResponseBody> {
    let bulk = match (reply.tree.take(), reply.object_cache.take()) {
        (Some(tree), Some(object_cache)) => Some((tree, object_cache)),
        _ => None,
    };
    let summary = match encode_line(&reply) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "Failed to encode poll summary");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response");
        }
    };
    let bulk_lines = stream::iter(bulk).then(|(tree, object_cache)| async move {
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut lines = encode_line(&*tree)?;
            lines.extend(encode_line(&*object_cache)?);
            Ok(lines)
        })
        .await
        .map_err(std::io::Error::other)?
    });
    let frames = stream::once(future::ready(Ok(summary)))
        .chain(bulk_lines)
        .map_ok(|lines| Frame::data(Bytes::from(lines)));
    with_status(
        StatusCode::OK,
        StreamBody::new(frames).boxed_unsync(),
        "application/x-ndjson",
    )
}

// ============================================================================
// Status page
// ============================================================================

fn status_page(status: &PollResponse) -> String {
    fn time(value: Option<chrono::DateTime<chrono::Utc>>) -> String {
        value.map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
    }
    let rows = [
        ("Start time", status.start_time.to_rfc3339()),
        ("Scan count", status.scan_count.to_string()),
        ("Generation", status.generation_count.to_string()),
        ("Last scan", time(status.last_scan_time)),
        ("Last change", time(status.last_change_time)),
        ("Regular inodes", status.num_regular_inodes.to_string()),
        ("Data bytes", status.total_data_bytes.to_string()),
        ("Network speed", format!("{} B/s", status.network_speed)),
        ("Fetch in progress", status.fetch_in_progress.to_string()),
        ("Update in progress", status.update_in_progress.to_string()),
        (
            "Last fetch error",
            status.last_fetch_error.clone().unwrap_or_default(),
        ),
        (
            "Last update error",
            status.last_update_error.clone().unwrap_or_default(),
        ),
        (
            "Trigger failures",
            status.last_update_had_trigger_failures.to_string(),
        ),
        (
            "Last image",
            status.last_successful_image_name.clone().unwrap_or_default(),
        ),
    ];
    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>subd status</title></head>\n<body>\n<h1>subd</h1>\n<table>\n",
    );
    for (label, value) in rows {
        page.push_str(&format!(
            "<tr><th align=\"left\">{label}</th><td>{}</td></tr>\n",
            escape_html(&value)
        ));
    }
    page.push_str("</table>\n</body>\n</html>\n");
    page
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn files_response(files: crate::service::FileStream) -> Response<ResponseBody> {
    let frames = files.map_ok(|chunk| Frame::data(Bytes::from(chunk)));
    with_status(
        StatusCode::OK,
        StreamBody::new(frames).boxed_unsync(),
        "application/octet-stream",
    )
}
