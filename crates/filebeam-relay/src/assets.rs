//! Plain HTTP on the relay port: client assets plus health endpoints
//!
//! - `GET /health` and `GET /stats` report hub counters as JSON
//! - any other `GET` is served from the public directory, `/` and directory
//!   paths mapping to `index.html`
//! - `HEAD` gets the same headers as `GET` without the body

use std::io;
use std::path::{Component, Path, PathBuf};

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::hub::HubHandle;
use crate::MAX_REQUEST_HEAD;

/// What a request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    Stats,
    File(PathBuf),
    NotFound,
    MethodNotAllowed,
}

/// A complete HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: &'static str,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    fn new(status: &'static str, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    fn json(value: serde_json::Value) -> Self {
        Self::new("200 OK", "application/json", value.to_string().into_bytes())
    }

    fn not_found() -> Self {
        Self::new(
            "404 Not Found",
            "application/json",
            br#"{"error":"not found"}"#.to_vec(),
        )
    }

    fn method_not_allowed() -> Self {
        Self::new(
            "405 Method Not Allowed",
            "application/json",
            br#"{"error":"method not allowed"}"#.to_vec(),
        )
    }
}

/// Answer one HTTP request and close
pub async fn serve_http<S>(stream: &mut S, public_dir: &Path, hub: &HubHandle) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let n = stream.read(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]);

    let route = route(&head, public_dir);
    let with_body = !is_head_request(&head);
    debug!("HTTP {:?}", route);

    let response = match route {
        Route::Health => {
            let stats = hub.stats().await.unwrap_or_default();
            Response::json(json!({
                "status": "healthy",
                "rooms": stats.rooms,
                "connections": stats.connections,
            }))
        }
        Route::Stats => {
            let stats = hub.stats().await.unwrap_or_default();
            Response::json(json!({
                "rooms": stats.rooms,
                "connections": stats.connections,
                "memberships": stats.memberships,
            }))
        }
        Route::File(path) => read_file(path).await,
        Route::NotFound => Response::not_found(),
        Route::MethodNotAllowed => Response::method_not_allowed(),
    };

    write_response(stream, &response, with_body).await
}

/// Route a request from its head
pub fn route(head: &str, public_dir: &Path) -> Route {
    let mut parts = head.lines().next().unwrap_or("").split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("/");

    if method != "GET" && method != "HEAD" {
        return Route::MethodNotAllowed;
    }

    let path = target.split(['?', '#']).next().unwrap_or("/");
    match path {
        "/health" => Route::Health,
        "/stats" => Route::Stats,
        _ => resolve(public_dir, path).map_or(Route::NotFound, Route::File),
    }
}

/// Whether the request only wants the response headers
pub fn is_head_request(head: &str) -> bool {
    head.split_whitespace().next() == Some("HEAD")
}

/// Map a request path onto a file under `public_dir`. Anything that could
/// escape the directory is refused.
pub fn resolve(public_dir: &Path, request_path: &str) -> Option<PathBuf> {
    if request_path.contains('\\') || request_path.contains('\0') {
        return None;
    }

    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut resolved = public_dir.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if request_path.ends_with('/') {
        resolved.push("index.html");
    }
    Some(resolved)
}

/// Content type from the file extension
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn read_file(mut path: PathBuf) -> Response {
    if tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        path.push("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(body) => Response::new("200 OK", content_type(&path), body),
        Err(e) => {
            debug!("Cannot serve {:?}: {}", path, e);
            Response::not_found()
        }
    }
}

async fn write_response<W>(out: &mut W, response: &Response, with_body: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len()
    );

    out.write_all(head.as_bytes()).await?;
    if with_body {
        out.write_all(&response.body).await?;
    }
    out.flush().await
}
