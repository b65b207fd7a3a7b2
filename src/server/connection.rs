//! Per-connection HTTP/1.1 state machine.
//!
//! One request per connection, `Connection: close` only. Parsing is manual:
//! there is no web framework here, because one that buffers a whole response
//! body in memory cannot stream an fMP4 byte range while it is still being
//! downloaded from the origin.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::cache::CacheStore;
use crate::datasource::{ByteRangeRequest, DataSource, HeadOnlyTracker, ResolveError, ResponseBody};
use crate::scheduler::Scheduler;

/// Opaque identifier for one accepted connection, used only for the
/// server's handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

const MAX_HEADER_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;

pub async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    store: Arc<CacheStore>,
    scheduler: Arc<Scheduler>,
    head_only: Option<Arc<HeadOnlyTracker>>,
    port: u16,
    cancel: Arc<Notify>,
) {
    trace!(%peer, "connection accepted");

    let request = tokio::select! {
        request = read_request(&mut socket) => request,
        _ = cancel.notified() => return,
    };

    let request = match request {
        Some(r) => r,
        None => return,
    };

    if request.path != "/proxy" {
        let _ = write_status_only(&mut socket, 404).await;
        return;
    }

    let remote_url = match request.url_param {
        Some(u) => u,
        None => {
            let _ = write_status_only(&mut socket, 404).await;
            return;
        }
    };

    let data_source = DataSource::new(store, scheduler, head_only, port);

    let resolved = tokio::select! {
        resolved = data_source.resolve(&remote_url, request.range) => resolved,
        _ = cancel.notified() => return,
    };

    match resolved {
        Ok(response) => {
            if write_response(&mut socket, response, &cancel).await.is_err() {
                debug!(%peer, "write failed, closing connection");
            }
        }
        Err(ResolveError::BadRange) => {
            let _ = write_status_only(&mut socket, 416).await;
        }
        Err(_) => {
            let _ = write_status_only(&mut socket, 404).await;
        }
    }
}

struct ParsedRequest {
    path: String,
    url_param: Option<String>,
    range: Option<ByteRangeRequest>,
}

/// Read and parse the request line plus headers, buffering up to
/// `MAX_HEADER_BYTES` before giving up.
async fn read_request(socket: &mut TcpStream) -> Option<ParsedRequest> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let header_end = loop {
        if let Some(pos) = find_header_terminator(&buf) {
            break pos;
        }
        if buf.len() >= MAX_HEADER_BYTES {
            return None;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..header_end]).ok()?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    if method != "GET" {
        return None;
    }
    let target = parts.next()?;

    let mut range = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = ByteRangeRequest::parse(value.trim());
            }
        }
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query)),
        None => (target.to_string(), None),
    };

    let url_param = query.and_then(parse_url_param);

    Some(ParsedRequest {
        path,
        url_param,
        range,
    })
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Extract `url=<percent-encoded>`, stopping at the first `&`.
fn parse_url_param(query: &str) -> Option<String> {
    let pair = query.split('&').next()?;
    let (key, value) = pair.split_once('=')?;
    if key != "url" {
        return None;
    }
    percent_encoding::percent_decode_str(value)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

async fn write_status_only(socket: &mut TcpStream, status: u16) -> std::io::Result<()> {
    let reason = reason_phrase(status);
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nConnection: close\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: 0\r\n\r\n"
    );
    socket.write_all(head.as_bytes()).await?;
    socket.shutdown().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        _ => "Error",
    }
}

/// Write the status line, mandatory headers, the delegate's headers, and
/// the body.
async fn write_response(
    socket: &mut TcpStream,
    response: crate::datasource::ResolvedResponse,
    cancel: &Arc<Notify>,
) -> std::io::Result<()> {
    let reason = reason_phrase(response.status);
    let mut head = format!(
        "HTTP/1.1 {} {reason}\r\nConnection: close\r\nAccess-Control-Allow-Origin: *\r\nContent-Type: {}\r\n",
        response.status, response.content_type
    );
    if response.accept_ranges {
        head.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(len) = response.content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    if let Some((lo, hi, total)) = response.content_range {
        match total {
            Some(size) => head.push_str(&format!("Content-Range: bytes {lo}-{hi}/{size}\r\n")),
            None => head.push_str(&format!("Content-Range: bytes {lo}-{hi}/*\r\n")),
        }
    }
    head.push_str("\r\n");
    socket.write_all(head.as_bytes()).await?;

    match response.body {
        ResponseBody::Whole(bytes) => {
            socket.write_all(&bytes).await?;
        }
        ResponseBody::Streamed(mut rx) => loop {
            tokio::select! {
                chunk = rx.recv() => {
                    match chunk {
                        Some(bytes) => socket.write_all(&bytes).await?,
                        None => break,
                    }
                }
                _ = cancel.notified() => {
                    warn!("connection cancelled mid-stream");
                    break;
                }
            }
        },
    }

    socket.shutdown().await
}
