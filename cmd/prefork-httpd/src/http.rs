//! Minimal HTTP/1.1 responder with keep-alive
//!
//! Hello mode answers every request with a short text body naming the
//! worker pid. With a document root it serves static files, 404 for
//! anything missing or outside the root.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prefork_core::env::{env_get_millis, env_get_opt};
use prefork_core::ProcessId;
use prefork_runtime::ConnectionHandler;

const SERVER_NAME: &str = "prefork-httpd";
const NOT_FOUND_BODY: &[u8] = b"404 Not Found\n";
const REQUEST_BUF: usize = 4096;

/// Default idle time before a keep-alive connection is dropped.
pub const DEFAULT_IDLE_MS: u64 = 5000;

/// Per-process counters.
#[derive(Debug, Default)]
pub struct Stats {
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub errors: AtomicU64,
}

pub struct HttpHandler {
    doc_root: Option<PathBuf>,
    idle_timeout: Duration,
    stats: Stats,
}

impl HttpHandler {
    pub fn new(doc_root: Option<PathBuf>, idle_timeout: Duration) -> Self {
        Self { doc_root, idle_timeout, stats: Stats::default() }
    }

    /// `PREFORK_DOC_ROOT` and `PREFORK_HTTP_IDLE_MS`.
    pub fn from_env() -> Self {
        Self::new(
            env_get_opt("PREFORK_DOC_ROOT"),
            env_get_millis("PREFORK_HTTP_IDLE_MS", DEFAULT_IDLE_MS),
        )
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn respond(&self, request: &[u8], pid: ProcessId, keep_alive: bool) -> Vec<u8> {
        let root = match self.doc_root {
            None => {
                let body = format!("Hello from prefork worker {}!\n", pid);
                return make_response("200 OK", "text/plain", body.as_bytes(), keep_alive);
            }
            Some(ref root) => root,
        };

        let path = parse_path(request).unwrap_or("/");
        let path = if path == "/" { "/index.html" } else { path };
        if path.contains("..") {
            return make_response("404 Not Found", "text/plain", NOT_FOUND_BODY, keep_alive);
        }

        let full_path = root.join(path.trim_start_matches('/'));
        match std::fs::read(&full_path) {
            Ok(content) => {
                let ctype = guess_content_type(path);
                make_response("200 OK", ctype, &content, keep_alive)
            }
            Err(_) => make_response("404 Not Found", "text/plain", NOT_FOUND_BODY, keep_alive),
        }
    }
}

impl ConnectionHandler for HttpHandler {
    fn serve(&self, mut stream: TcpStream, pid: ProcessId) -> io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.idle_timeout))?;

        let mut buf = [0u8; REQUEST_BUF];
        let mut pos = 0usize;

        loop {
            let header_end = match buf[..pos].windows(4).position(|w| w == b"\r\n\r\n") {
                Some(p) => p + 4,
                None if pos >= buf.len() => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "request header too large"));
                }
                None => {
                    match stream.read(&mut buf[pos..]) {
                        Ok(0) => return Ok(()),
                        Ok(n) => {
                            self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                            pos += n;
                        }
                        // Idle keep-alive connection
                        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                            return Ok(());
                        }
                        Err(e) => {
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            return Err(e);
                        }
                    }
                    continue;
                }
            };
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            let request = &buf[..header_end];
            let keep_alive = wants_keep_alive(request);
            let response = self.respond(request, pid, keep_alive);

            stream.write_all(&response)?;
            self.stats.bytes_out.fetch_add(response.len() as u64, Ordering::Relaxed);
            self.stats.responses.fetch_add(1, Ordering::Relaxed);

            if !keep_alive {
                return Ok(());
            }

            // Pipelined bytes after this request stay for the next round.
            buf.copy_within(header_end..pos, 0);
            pos -= header_end;
        }
    }
}

fn make_response(status: &str, content_type: &str, body: &[u8], keep_alive: bool) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n\
         Server: {}\r\n\
         \r\n",
        status,
        content_type,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
        SERVER_NAME,
    );
    let mut resp = header.into_bytes();
    resp.extend_from_slice(body);
    resp
}

fn guess_content_type(path: &str) -> &'static str {
    if path.ends_with(".html") || path.ends_with(".htm") { "text/html" }
    else if path.ends_with(".css") { "text/css" }
    else if path.ends_with(".js") { "application/javascript" }
    else if path.ends_with(".json") { "application/json" }
    else if path.ends_with(".txt") { "text/plain" }
    else if path.ends_with(".png") { "image/png" }
    else if path.ends_with(".jpg") || path.ends_with(".jpeg") { "image/jpeg" }
    else { "application/octet-stream" }
}

/// Extract path from "GET /path HTTP/1.1\r\n..."
fn parse_path(buf: &[u8]) -> Option<&str> {
    if buf.len() < 14 || &buf[..4] != b"GET " {
        return Some("/");
    }
    let start = 4;
    let end = buf[start..]
        .iter()
        .position(|&b| b == b' ')
        .map(|p| start + p)
        .unwrap_or(start + 1);
    std::str::from_utf8(&buf[start..end]).ok()
}

/// HTTP/1.1 defaults to keep-alive unless the client says otherwise.
fn wants_keep_alive(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request).to_ascii_lowercase();
    if text.contains("\r\nconnection: close") {
        return false;
    }
    if text.contains("\r\nconnection: keep-alive") {
        return true;
    }
    text.lines().next().map_or(false, |line| line.trim_end().ends_with("http/1.1"))
}
