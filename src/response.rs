//! Response values and their serialization to bytes.
//!
//! Grounded on the teacher's `message::Message`/`MessageState` (status line
//! first, then headers, then a length-checked body), simplified from a
//! streaming state machine into a plain builder: this server buffers whole
//! responses (§4.4 "streaming is not required at this bar"), so there is no
//! need to track a body-writing state across multiple `write_body` calls.

use std::time::SystemTime;

use crate::version::Version;

/// `Server:` header value advertised on every response.
pub const SERVER_BANNER: &str = "webserv/1.0";

/// An HTTP response under construction or ready to serialize.
///
/// Headers are kept in insertion order (a `Vec`, not a map) because the
/// spec requires "insertion order preserved when serialized" and because
/// responses rarely carry more than a handful of headers.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub keep_alive: bool,
    /// Suppresses Content-Length and body entirely (204, and any response
    /// the spec calls "must serialize without a body").
    pub no_body: bool,
}

impl Response {
    fn new(status: u16) -> Response {
        Response {
            status,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
            no_body: false,
        }
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        if let Some(existing) = self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            existing.1 = value.into();
        } else {
            self.headers.push((name.to_string(), value.into()));
        }
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// `200 OK` with a body and an explicit content type.
    pub fn ok(body: Vec<u8>, content_type: &str) -> Response {
        let mut r = Response::new(200);
        r.set_header("Content-Type", content_type);
        r.body = body;
        r
    }

    /// `code` with either the caller's body or a synthesized default error
    /// page (see [`default_error_page`]).
    pub fn error(code: u16, body: Option<Vec<u8>>) -> Response {
        let mut r = Response::new(code);
        match body {
            Some(b) => r.body = b,
            None => {
                r.set_header("Content-Type", "text/html");
                r.body = default_error_page(code, reason_phrase(code));
            }
        }
        r
    }

    /// A redirect response; `code` must be one of 301/302/303/307/308 per
    /// the config model's invariant (enforced by the config parser, not
    /// here).
    pub fn redirect(code: u16, location: &str) -> Response {
        let mut r = Response::new(code);
        r.set_header("Location", location);
        r
    }

    /// `204 No Content`: must serialize without a body and without
    /// `Content-Length`.
    pub fn no_content() -> Response {
        let mut r = Response::new(204);
        r.no_body = true;
        r
    }

    /// Build a response directly from a status code and a caller-supplied
    /// header list, as produced by [`crate::cgi`] parsing a script's output
    /// (§4.6 "Other headers are forwarded verbatim").
    pub fn from_parts(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Response {
        let mut r = Response::new(status);
        r.headers = headers;
        r.body = body;
        r
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| reason_phrase(self.status))
    }

    /// Serialize the status line, headers (filling in `Server`, `Date`,
    /// `Content-Length`/absence thereof, and `Connection` when the caller
    /// hasn't already set them), and body.
    pub fn serialize(&mut self, version: Version) -> Vec<u8> {
        if !self.has_header("Server") {
            self.set_header("Server", SERVER_BANNER);
        }
        if !self.has_header("Date") {
            self.set_header("Date", httpdate::fmt_http_date(SystemTime::now()));
        }
        if self.no_body {
            self.body.clear();
            self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case("content-length"));
        } else if !self.has_header("Content-Length") && !self.has_header("Transfer-Encoding") {
            self.set_header("Content-Length", self.body.len().to_string());
        }
        if !self.has_header("Connection") {
            self.set_header("Connection", if self.keep_alive { "keep-alive" } else { "close" });
        }

        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("{} {} {}\r\n", version, self.status, self.reason()).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if !self.no_body {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

/// `CODE reason` page, used whenever a 4xx/5xx response has no body and no
/// configured custom error page.
pub fn default_error_page(code: u16, reason: &str) -> Vec<u8> {
    format!("<html><body><h1>{} {}</h1></body></html>", code, reason).into_bytes()
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Extension (without the leading dot, ASCII-lowercased by the caller) →
/// MIME type. Unknown extensions fall back to `application/octet-stream`.
pub fn mime_type_for_extension(ext: &str) -> &'static str {
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ok_response_serializes_with_length_and_type() {
        let mut r = Response::ok(b"hello".to_vec(), "text/plain");
        let bytes = r.serialize(Version::Http11);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn no_content_has_no_length_or_body() {
        let mut r = Response::no_content();
        let bytes = r.serialize(Version::Http11);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_without_body_synthesizes_default_page() {
        let mut r = Response::error(404, None);
        let bytes = r.serialize(Version::Http11);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("<h1>404 Not Found</h1>"));
        assert!(text.contains("Content-Type: text/html"));
    }

    #[test]
    fn redirect_sets_location() {
        let mut r = Response::redirect(302, "/new-place");
        let bytes = r.serialize(Version::Http11);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("Location: /new-place\r\n"));
    }

    #[test]
    fn close_connection_reflected_in_header() {
        let mut r = Response::ok(Vec::new(), "text/plain");
        r.keep_alive = false;
        let bytes = r.serialize(Version::Http11);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn mime_table_covers_known_and_unknown_extensions() {
        assert_eq!(mime_type_for_extension("html"), "text/html");
        assert_eq!(mime_type_for_extension("json"), "application/json");
        assert_eq!(mime_type_for_extension("xyz"), "application/octet-stream");
    }

    #[test]
    fn caller_set_headers_are_not_overwritten() {
        let mut r = Response::new_for_test(200);
        r.set_header("Connection", "close");
        r.keep_alive = true;
        let bytes = r.serialize(Version::Http11);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Connection: keep-alive"));
    }
}

#[cfg(test)]
impl Response {
    fn new_for_test(status: u16) -> Response {
        Response::new(status)
    }
}
