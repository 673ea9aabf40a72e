//! Server/location selection, method authorization, path resolution, and
//! dispatch to static-file serving, directory listing, uploads, deletes,
//! and CGI.
//!
//! Grounded on `ServerConfig::findLocation` and `Router.hpp` from the
//! original implementation for the matching and dispatch rules; the static
//! file, listing, and upload handlers are new code following those rules,
//! styled after the teacher's plain `fn(&Request) -> Response`-shaped
//! handlers (no trait object indirection, per §9's "narrow interface, not
//! a class hierarchy" note).

use std::fs;
use std::net::IpAddr;
use std::time::UNIX_EPOCH;

use log::warn;

use crate::cgi;
use crate::config::{LocationRule, ServerRule};
use crate::request::Request;
use crate::response::{mime_type_for_extension, Response};
use crate::util;

pub struct PeerInfo {
    pub addr: IpAddr,
    pub port: u16,
}

/// `route(request, acceptedPort) -> Response`, per §4.3.
///
/// Assumes `request` already parsed successfully; a parser `Failed(code)`
/// outcome is turned into a `Response` by the connection before the router
/// is ever invoked (§4.3: "If the request has a parse error, return the
/// corresponding error code without consulting config").
pub fn route(request: &Request, accepted_port: u16, servers: &[ServerRule], peer: &PeerInfo) -> Response {
    let server = match select_server(request, accepted_port, servers) {
        Some(s) => s,
        None => return with_custom_page(404, None),
    };

    // The connection's parser is seeded with the largest `client_max_body_size`
    // among the servers sharing its port (the matching server isn't known
    // until the `Host` header, inside the body-size-bearing headers
    // themselves, has been read). Re-check against the server actually
    // selected so a small-limit server on a shared port still gets 413.
    if (request.body.len() as u64) > server.client_max_body_size {
        return with_custom_page(413, Some(server));
    }

    let location = match server.find_location(&request.path) {
        Some(l) => l,
        None => return with_custom_page(404, Some(server)),
    };

    if let Some((code, target)) = &location.redirect {
        return Response::redirect(*code, target);
    }

    if request.method == "HEAD" || !matches!(request.method.as_str(), "GET" | "POST" | "DELETE") {
        return with_custom_page(501, Some(server));
    }
    if !location.methods.iter().any(|m| m == &request.method) {
        let mut resp = with_custom_page(405, Some(server));
        resp.set_header("Allow", location.methods.join(", "));
        return resp;
    }

    let resolved = match resolve_request_path(request, location) {
        Some(p) => p,
        None => return with_custom_page(403, Some(server)),
    };

    if cgi::is_cgi_request(location, &resolved.fs_path) {
        return cgi::execute(request, server, location, &resolved, peer);
    }

    match request.method.as_str() {
        "GET" => handle_get(&resolved, location, server),
        "POST" => handle_post(request, location, server),
        "DELETE" => handle_delete(&resolved, server),
        _ => unreachable!(),
    }
}

fn select_server<'a>(request: &Request, accepted_port: u16, servers: &'a [ServerRule]) -> Option<&'a ServerRule> {
    let candidates: Vec<&ServerRule> = servers.iter().filter(|s| s.port == accepted_port).collect();
    if candidates.is_empty() {
        return None;
    }
    let host = request
        .get_header("host")
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("");
    candidates
        .iter()
        .find(|s| s.server_names.iter().any(|n| n.eq_ignore_ascii_case(host)))
        .or_else(|| candidates.first())
        .copied()
}

/// Build an error response for `code`, preferring the server's configured
/// `error_page` (if present and readable) over the synthesized default page
/// (§7 "the configured custom error page ... or the synthesized default
/// page").
fn with_custom_page(code: u16, server: Option<&ServerRule>) -> Response {
    if let Some(server) = server {
        if let Some(path) = server.error_page_for(code) {
            if let Ok(body) = fs::read(path) {
                let mut resp = Response::error(code, Some(body));
                resp.set_header("Content-Type", "text/html");
                return resp;
            }
        }
    }
    Response::error(code, None)
}

/// The request path after percent-decoding, segment normalization, and
/// joining onto the matched location's root.
pub struct ResolvedPath {
    pub fs_path: std::path::PathBuf,
    /// The portion of the (decoded, normalized) request path past the
    /// location prefix, e.g. `/cgi-bin/report.py` with prefix `/cgi-bin`
    /// gives `/report.py`.
    pub path_after_prefix: String,
    /// The full decoded, normalized request path (`SCRIPT_NAME` for CGI).
    pub normalized_path: String,
}

fn resolve_request_path(request: &Request, location: &LocationRule) -> Option<ResolvedPath> {
    let decoded = util::percent_decode(&request.path)?;
    let normalized = util::normalize_path_segments(&decoded);
    let after_prefix = if location.prefix == "/" {
        normalized.clone()
    } else {
        normalized.strip_prefix(&location.prefix).unwrap_or(&normalized).to_string()
    };
    let fs_path = util::resolve_under_root(&location.root, &after_prefix)?;
    Some(ResolvedPath { fs_path, path_after_prefix: after_prefix, normalized_path: normalized })
}

fn handle_get(resolved: &ResolvedPath, location: &LocationRule, server: &ServerRule) -> Response {
    let metadata = match fs::metadata(&resolved.fs_path) {
        Ok(m) => m,
        Err(e) => return with_custom_page(error_for_io(&e), Some(server)),
    };

    if metadata.is_dir() {
        if let Some(index) = &location.index {
            let index_path = resolved.fs_path.join(index);
            if index_path.is_file() {
                return serve_file(&index_path, server);
            }
        }
        if location.autoindex {
            return directory_listing(&resolved.fs_path, location);
        }
        return with_custom_page(403, Some(server));
    }

    serve_file(&resolved.fs_path, server)
}

/// §4.4 File serving.
fn serve_file(path: &std::path::Path, server: &ServerRule) -> Response {
    let body = match fs::read(path) {
        Ok(b) => b,
        Err(e) => return with_custom_page(error_for_io(&e), Some(server)),
    };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    Response::ok(body, mime_type_for_extension(&ext))
}

fn error_for_io(err: &std::io::Error) -> u16 {
    use std::io::ErrorKind::*;
    match err.kind() {
        NotFound => 404,
        PermissionDenied => 403,
        _ => 500,
    }
}

/// §4.5 Directory listing.
fn directory_listing(dir: &std::path::Path, location: &LocationRule) -> Response {
    let mut entries: Vec<(String, bool, u64, i64)> = Vec::new();
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(_) => return Response::error(500, None),
    };
    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "." {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        entries.push((name, metadata.is_dir(), metadata.len(), mtime));
    }

    let is_root = dir == location.root;
    if !is_root {
        entries.push(("..".to_string(), true, 0, 0));
    }

    entries.sort_by(|a, b| match (a.1, b.1) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()),
    });

    let mut html = String::new();
    html.push_str("<html><body><table>\n");
    for (name, is_dir, size, mtime) in entries {
        let display_name = if is_dir { format!("{}/", name) } else { name.clone() };
        let size_text = if is_dir { String::new() } else { util::format_file_size(size) };
        let time_text = format_mtime(mtime);
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            util::escape_html(&display_name),
            util::escape_html(&size_text),
            util::escape_html(&time_text),
        ));
    }
    html.push_str("</table></body></html>");
    Response::ok(html.into_bytes(), "text/html")
}

fn format_mtime(unix_secs: i64) -> String {
    // A minimal, dependency-free UTC breakdown; good enough for directory
    // listings which don't need calendar arithmetic beyond "days since
    // epoch".
    let days = unix_secs.div_euclid(86400);
    let secs_of_day = unix_secs.rem_euclid(86400);
    let (hour, minute) = (secs_of_day / 3600, (secs_of_day % 3600) / 60);
    let (y, m, d) = civil_from_days(days);
    format!("{:04}-{:02}-{:02} {:02}:{:02}", y, m, d, hour, minute)
}

/// Howard Hinnant's days-from-civil algorithm, inverted; operates purely on
/// integers so it needs no chrono-like dependency for this one use.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// §4.3 POST to an `upload_dir` location.
fn handle_post(request: &Request, location: &LocationRule, server: &ServerRule) -> Response {
    let upload_dir = match &location.upload_dir {
        Some(dir) => dir,
        None => return with_custom_page(403, Some(server)),
    };

    let content_type = request.get_header("content-type").unwrap_or("");
    let saved = if content_type.to_ascii_lowercase().starts_with("multipart/form-data") {
        let boundary = match util::extract_boundary(content_type) {
            Some(b) => b,
            None => return with_custom_page(400, Some(server)),
        };
        let parts = util::parse_multipart(&request.body, &boundary);
        let mut saved_names = Vec::new();
        for part in parts.into_iter().filter(|p| p.filename.is_some()) {
            let filename = util::sanitize_filename(&part.filename.unwrap());
            let unique = util::uniquify_filename(upload_dir, &filename);
            if fs::write(upload_dir.join(&unique), &part.data).is_err() {
                return with_custom_page(500, Some(server));
            }
            saved_names.push(unique);
        }
        saved_names
    } else if content_type.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
        let pairs = util::decode_form_urlencoded(&request.body);
        let mut saved_names = Vec::new();
        for (name, value) in pairs {
            let filename = util::sanitize_filename(&name);
            let unique = util::uniquify_filename(upload_dir, &filename);
            if fs::write(upload_dir.join(&unique), value.as_bytes()).is_err() {
                return with_custom_page(500, Some(server));
            }
            saved_names.push(unique);
        }
        saved_names
    } else {
        return with_custom_page(400, Some(server));
    };

    let body = format!(
        "<html><body><h1>Upload complete</h1><ul>{}</ul></body></html>",
        saved.iter().map(|n| format!("<li>{}</li>", util::escape_html(n))).collect::<String>()
    );
    let mut resp = Response::ok(body.into_bytes(), "text/html");
    resp.status = 201;
    resp
}

/// §4.3 DELETE on a file.
fn handle_delete(resolved: &ResolvedPath, server: &ServerRule) -> Response {
    match fs::metadata(&resolved.fs_path) {
        Ok(m) if m.is_dir() => with_custom_page(409, Some(server)),
        Ok(_) => match fs::remove_file(&resolved.fs_path) {
            Ok(()) => Response::no_content(),
            Err(e) => {
                warn!("delete failed for {:?}: {}", resolved.fs_path, e);
                with_custom_page(error_for_io(&e), Some(server))
            }
        },
        Err(e) => with_custom_page(error_for_io(&e), Some(server)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerRule;
    use crate::headers::HeaderMap;
    use crate::version::Version;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn peer() -> PeerInfo {
        PeerInfo { addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port: 54321 }
    }

    fn request(method: &str, path: &str) -> Request {
        let mut headers = HeaderMap::new();
        headers.insert("Host", "localhost");
        Request {
            method: method.to_string(),
            raw_uri: path.to_string(),
            path: path.to_string(),
            query: String::new(),
            version: Version::Http11,
            headers,
            body: Vec::new(),
        }
    }

    fn server_with_root(root: &std::path::Path) -> ServerRule {
        let mut server = ServerRule {
            host: "0.0.0.0".to_string(),
            port: 8080,
            server_names: vec!["localhost".to_string()],
            error_pages: Vec::new(),
            client_max_body_size: 1024 * 1024,
            locations: Vec::new(),
        };
        let mut loc = LocationRule::new("/".to_string());
        loc.root = root.to_path_buf();
        loc.index = Some("index.html".to_string());
        loc.autoindex = true;
        loc.methods = vec!["GET".to_string(), "POST".to_string(), "DELETE".to_string()];
        server.locations.push(loc);
        server
    }

    #[test]
    fn serves_static_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"hello world").unwrap();
        let servers = vec![server_with_root(dir.path())];
        let resp = route(&request("GET", "/index.html"), 8080, &servers, &peer());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello world");
    }

    #[test]
    fn missing_file_is_404() {
        let dir = tempdir().unwrap();
        let servers = vec![server_with_root(dir.path())];
        let resp = route(&request("GET", "/nope.html"), 8080, &servers, &peer());
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn missing_file_serves_configured_custom_error_page() {
        let dir = tempdir().unwrap();
        let error_page = dir.path().join("404.html");
        fs::write(&error_page, b"<html>custom not found</html>").unwrap();
        let mut server = server_with_root(dir.path());
        server.error_pages.push((404, error_page));
        let servers = vec![server];
        let resp = route(&request("GET", "/nope.html"), 8080, &servers, &peer());
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body, b"<html>custom not found</html>");
    }

    #[test]
    fn traversal_never_escapes_root() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"ok").unwrap();
        let servers = vec![server_with_root(dir.path())];
        let resp = route(&request("GET", "/../../../etc/passwd"), 8080, &servers, &peer());
        assert!(resp.status == 404 || resp.status == 403);
    }

    #[test]
    fn delete_nonexistent_is_404_then_404_again() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"data").unwrap();
        let servers = vec![server_with_root(dir.path())];
        let resp = route(&request("DELETE", "/x.txt"), 8080, &servers, &peer());
        assert_eq!(resp.status, 204);
        let resp2 = route(&request("DELETE", "/x.txt"), 8080, &servers, &peer());
        assert_eq!(resp2.status, 404);
    }

    #[test]
    fn delete_on_directory_is_409() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let servers = vec![server_with_root(dir.path())];
        let resp = route(&request("DELETE", "/sub"), 8080, &servers, &peer());
        assert_eq!(resp.status, 409);
    }

    #[test]
    fn head_is_not_implemented() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"ok").unwrap();
        let servers = vec![server_with_root(dir.path())];
        let resp = route(&request("HEAD", "/index.html"), 8080, &servers, &peer());
        assert_eq!(resp.status, 501);
    }

    #[test]
    fn method_not_in_location_allow_list_is_405() {
        let dir = tempdir().unwrap();
        let mut server = server_with_root(dir.path());
        server.locations[0].methods = vec!["GET".to_string()];
        let resp = route(&request("DELETE", "/x.txt"), 8080, &[server], &peer());
        assert_eq!(resp.status, 405);
        assert_eq!(resp.headers.iter().find(|(n, _)| n == "Allow").map(|(_, v)| v.as_str()), Some("GET"));
    }

    #[test]
    fn autoindex_lists_directory() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let servers = vec![server_with_root(dir.path())];
        let resp = route(&request("GET", "/"), 8080, &servers, &peer());
        assert_eq!(resp.status, 200);
        let body = String::from_utf8(resp.body).unwrap();
        assert!(body.contains("sub/"));
        assert!(body.contains("a.txt"));
    }
}
