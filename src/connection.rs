//! Per-peer connection state: buffers, lifecycle, timestamps, and the
//! keep-alive reset dance (§4.7, §3 "Connection").
//!
//! Grounded on `HttpConnection` in `other_examples/ab061287_kill-ux-01-server
//! __src-http-http_connection.rs.rs` (`read_data`/`write_data`/`touch`,
//! `last_activity` for the idle sweep) and `aa927238_..._server.rs.rs`'s
//! `read_data`/`write_data` pair, adapted to the spec's "exactly one `recv`
//! per readiness notification" read path and its own incremental parser
//! instead of a borrowed byte buffer.

use std::io::{self, ErrorKind, Read, Write};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use crate::config::ServerRule;
use crate::request::{Outcome, RequestParser};
use crate::response::Response;
use crate::router::{self, PeerInfo};
use crate::version::Version;

const STAGING_BUF_SIZE: usize = 8192;

/// §3 "Connection. ... Lifecycle state".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    Writing,
    Closed,
    Error,
}

/// Owns one accepted peer socket from `accept()` until it is torn down.
pub struct Connection {
    socket: TcpStream,
    pub peer_addr: IpAddr,
    pub peer_port: u16,
    pub accepted_port: u16,
    pub connected_at: Instant,
    last_activity: Instant,
    pub state: ConnState,
    write_buf: Vec<u8>,
    write_offset: usize,
    parser: RequestParser,
    max_body_size: u64,
    /// Decided once a response is built; applied when the write fully
    /// drains (§4.7 "Keep-alive decision").
    pending_keep_alive: bool,
    /// Bytes the parser had already buffered past the end of the request it
    /// just completed (HTTP pipelining). Re-fed once the parser is reset.
    pending_leftover: Vec<u8>,
    /// The HTTP version of the most recently completed request, used to
    /// serialize an error response built before any request exists (the
    /// very first message on the connection) and to serialize the status
    /// line consistently across a keep-alive connection's lifetime.
    last_version: Version,
}

impl Connection {
    pub fn new(socket: TcpStream, peer_addr: IpAddr, peer_port: u16, accepted_port: u16, max_body_size: u64) -> Connection {
        let now = Instant::now();
        Connection {
            socket,
            peer_addr,
            peer_port,
            accepted_port,
            connected_at: now,
            last_activity: now,
            state: ConnState::Reading,
            write_buf: Vec::new(),
            write_offset: 0,
            parser: RequestParser::new(max_body_size),
            max_body_size,
            pending_keep_alive: true,
            pending_leftover: Vec::new(),
            last_version: Version::Http11,
        }
    }

    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    pub fn is_idle_past(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// §4.7 Read path: one `recv` per readiness notification, fed to the
    /// parser, dispatched through the router on completion.
    pub fn handle_readable(&mut self, servers: &[ServerRule]) {
        let mut staging = [0u8; STAGING_BUF_SIZE];
        match self.socket.read(&mut staging) {
            Ok(0) => self.state = ConnState::Closed,
            Ok(n) => {
                self.touch();
                match self.parser.feed(&staging[..n]) {
                    Outcome::NeedMore => {}
                    Outcome::Complete => self.dispatch_complete(servers),
                    Outcome::Failed(code) => self.dispatch_error(code),
                }
            }
            Err(e) if would_block(&e) => {}
            Err(_) => self.state = ConnState::Error,
        }
    }

    /// §4.7 Write path: drain as much of the write buffer as the socket
    /// accepts; on full drain, reset for keep-alive or close.
    pub fn handle_writable(&mut self, servers: &[ServerRule]) {
        match self.socket.write(&self.write_buf[self.write_offset..]) {
            Ok(0) => self.state = ConnState::Closed,
            Ok(n) => {
                self.touch();
                self.write_offset += n;
                if self.write_offset >= self.write_buf.len() {
                    self.finish_write(servers);
                }
            }
            Err(e) if would_block(&e) => {}
            Err(_) => self.state = ConnState::Error,
        }
    }

    fn finish_write(&mut self, servers: &[ServerRule]) {
        if !self.pending_keep_alive {
            self.state = ConnState::Closed;
            return;
        }
        self.write_buf.clear();
        self.write_offset = 0;
        self.parser.reset(self.max_body_size);
        self.state = ConnState::Reading;
        let leftover = std::mem::take(&mut self.pending_leftover);
        if leftover.is_empty() {
            return;
        }
        // The next request's bytes already arrived in the same `recv` as
        // the one we just finished responding to. §5 only requires that it
        // be parsed *after* the response is fully written, which just
        // happened, so feed it now rather than wait for another readiness
        // notification that may not come (e.g. an otherwise-idle client
        // that sent two pipelined requests back to back).
        match self.parser.feed(&leftover) {
            Outcome::NeedMore => {}
            Outcome::Complete => self.dispatch_complete(servers),
            Outcome::Failed(code) => self.dispatch_error(code),
        }
    }

    fn dispatch_complete(&mut self, servers: &[ServerRule]) {
        let request = self.parser.take_request();
        let leftover = self.parser.take_leftover();
        let peer = PeerInfo { addr: self.peer_addr, port: self.peer_port };
        let mut response = router::route(&request, self.accepted_port, servers, &peer);
        let keep_alive = decide_keep_alive(&request, &response);
        response.keep_alive = keep_alive;
        self.last_version = request.version;
        self.write_buf = response.serialize(request.version);
        self.write_offset = 0;
        self.pending_keep_alive = keep_alive;
        self.pending_leftover = leftover;
        self.state = ConnState::Writing;
    }

    fn dispatch_error(&mut self, code: u16) {
        let mut response = Response::error(code, None);
        response.keep_alive = false;
        self.write_buf = response.serialize(self.last_version);
        self.write_offset = 0;
        self.pending_keep_alive = false;
        self.pending_leftover = Vec::new();
        self.state = ConnState::Writing;
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

/// §4.7 "Keep-alive decision": HTTP/1.1 defaults to keep-alive unless
/// `Connection: close`; HTTP/1.0 defaults to close unless
/// `Connection: keep-alive`.
fn decide_keep_alive(request: &crate::request::Request, _response: &Response) -> bool {
    let connection_header = request.get_header("connection").map(|v| v.to_ascii_lowercase());
    match request.version {
        Version::Http11 => connection_header.as_deref() != Some("close"),
        Version::Http10 => connection_header.as_deref() == Some("keep-alive"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::headers::HeaderMap;
    use crate::request::Request;

    fn request_with(version: Version, connection: Option<&str>) -> Request {
        let mut headers = HeaderMap::new();
        headers.insert("Host", "x");
        if let Some(v) = connection {
            headers.insert("Connection", v);
        }
        Request {
            method: "GET".to_string(),
            raw_uri: "/".to_string(),
            path: "/".to_string(),
            query: String::new(),
            version,
            headers,
            body: Vec::new(),
        }
    }

    #[test]
    fn http11_keeps_alive_by_default() {
        let req = request_with(Version::Http11, None);
        assert!(decide_keep_alive(&req, &Response::ok(Vec::new(), "text/plain")));
    }

    #[test]
    fn http11_closes_on_connection_close() {
        let req = request_with(Version::Http11, Some("close"));
        assert!(!decide_keep_alive(&req, &Response::ok(Vec::new(), "text/plain")));
    }

    #[test]
    fn http10_closes_by_default() {
        let req = request_with(Version::Http10, None);
        assert!(!decide_keep_alive(&req, &Response::ok(Vec::new(), "text/plain")));
    }

    #[test]
    fn http10_keeps_alive_on_explicit_header() {
        let req = request_with(Version::Http10, Some("keep-alive"));
        assert!(decide_keep_alive(&req, &Response::ok(Vec::new(), "text/plain")));
    }
}
