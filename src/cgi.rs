//! Fork/exec of CGI scripts: environment construction (RFC 3875 subset),
//! non-blocking pipe I/O bounded by a wall-clock timeout, and CGI-output
//! parsing.
//!
//! Grounded on the CGI handling in `other_examples/f1f668fc_kill-ux-01-server
//! __src-cgi.rs.rs` (`parse_cgi_output`, `build_cgi_env`, `force_cgi_timeout`)
//! and `other_examples/ab061287_..._http_connection.rs.rs` (`ActiveAction::Cgi`
//! owning the child and both pipe ends). That implementation folds CGI I/O
//! into the same `mio` readiness loop as client sockets; this one instead
//! runs its own short blocking loop for the duration of one `execute` call,
//! matching §4.6/§9's model where the router invokes CGI inline and the
//! executor owns the child only for that one invocation. Both amount to the
//! same non-blocking-pipes-plus-deadline strategy; this one needs no `Token`
//! bookkeeping since no other connection can make progress while the single
//! server thread is inside `execute`.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::warn;

use crate::config::{LocationRule, ServerRule};
use crate::request::Request;
use crate::response::{self, Response};
use crate::router::{PeerInfo, ResolvedPath};

/// §4.6 "Default 30 seconds wall-clock from fork."
const CGI_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 8192;
const KILL_GRACE: Duration = Duration::from_millis(200);

/// `isCgiRequest` (§4.6): true iff the location has a CGI extension and the
/// resolved script path ends with exactly it.
pub fn is_cgi_request(location: &LocationRule, fs_path: &Path) -> bool {
    match &location.cgi_extension {
        Some(ext) if !ext.is_empty() => fs_path.to_str().map(|p| p.ends_with(ext.as_str())).unwrap_or(false),
        _ => false,
    }
}

/// Validate, fork, run to completion or timeout, and parse the script's
/// output into a [`Response`]. Never leaves a zombie: every return path has
/// already reaped the child.
pub fn execute(
    request: &Request,
    server: &ServerRule,
    location: &LocationRule,
    resolved: &ResolvedPath,
    peer: &PeerInfo,
) -> Response {
    execute_with_timeout(request, server, location, resolved, peer, CGI_TIMEOUT)
}

fn execute_with_timeout(
    request: &Request,
    server: &ServerRule,
    location: &LocationRule,
    resolved: &ResolvedPath,
    peer: &PeerInfo,
    timeout: Duration,
) -> Response {
    let script = &resolved.fs_path;
    let interpreter = match &location.cgi_path {
        Some(p) => p,
        None => return Response::error(500, None),
    };

    match fs::metadata(script) {
        Ok(m) if m.is_file() && is_executable(&m) => {}
        Ok(_) => return Response::error(403, None),
        Err(_) => return Response::error(404, None),
    }
    match fs::metadata(interpreter) {
        Ok(m) if m.is_file() && is_executable(&m) => {}
        _ => return Response::error(500, None),
    }

    let script_dir = match script.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let basename = match script.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return Response::error(500, None),
    };

    let mut command = Command::new(interpreter);
    command
        .arg(basename)
        .current_dir(script_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    apply_cgi_env(&mut command, request, server, location, resolved, peer);

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to spawn CGI interpreter {:?}: {}", interpreter, e);
            return Response::error(500, None);
        }
    };

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take().expect("stdout was piped");
    if let Some(pipe) = &stdin {
        set_nonblocking(pipe.as_raw_fd());
    }
    set_nonblocking(stdout.as_raw_fd());

    let deadline = Instant::now() + timeout;
    let body = &request.body;
    let mut written = 0usize;
    let mut output = Vec::new();
    let mut read_buf = [0u8; READ_CHUNK];

    loop {
        if written >= body.len() {
            // Dropping the write end sends EOF to the script's stdin.
            stdin = None;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            terminate(&mut child);
            return Response::error(504, None);
        }

        let mut fds = Vec::with_capacity(2);
        let stdin_idx = stdin.as_ref().map(|pipe| {
            fds.push(libc::pollfd { fd: pipe.as_raw_fd(), events: libc::POLLOUT, revents: 0 });
            fds.len() - 1
        });
        let stdout_idx = fds.len();
        fds.push(libc::pollfd { fd: stdout.as_raw_fd(), events: libc::POLLIN, revents: 0 });

        let timeout_ms = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            break;
        }

        if let Some(idx) = stdin_idx {
            if fds[idx].revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
                if let Some(pipe) = stdin.as_mut() {
                    match pipe.write(&body[written..]) {
                        Ok(n) => written += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(_) => stdin = None,
                    }
                }
            }
        }

        if fds[stdout_idx].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            match stdout.read(&mut read_buf) {
                Ok(0) => {}
                Ok(n) => output.extend_from_slice(&read_buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => {}
            }
        }

        if let Ok(Some(_)) = child.try_wait() {
            drain_remaining(&mut stdout, &mut output);
            break;
        }
    }

    let status = match child.wait() {
        Ok(s) => s,
        Err(_) => return Response::error(500, None),
    };
    if status.signal().is_some() {
        return Response::error(500, None);
    }

    parse_cgi_output(&output)
}

fn drain_remaining(stdout: &mut impl Read, output: &mut Vec<u8>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
}

/// §4.6 timeout handling: SIGTERM, a brief grace period, then SIGKILL.
/// Always reaps, so the child never becomes a zombie.
fn terminate(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    std::thread::sleep(KILL_GRACE);
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            let _ = child.kill(); // SIGKILL
            let _ = child.wait();
        }
    }
}

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.permissions().mode() & 0o111 != 0
}

/// §4.6 "Environment construction (RFC 3875 subset)".
fn apply_cgi_env(
    command: &mut Command,
    request: &Request,
    server: &ServerRule,
    location: &LocationRule,
    resolved: &ResolvedPath,
    peer: &PeerInfo,
) {
    let ext = location.cgi_extension.as_deref().unwrap_or("");
    let (script_part, path_info) = split_script_and_path_info(&resolved.path_after_prefix, ext);
    let script_name = if location.prefix == "/" {
        script_part
    } else {
        format!("{}{}", location.prefix, script_part)
    };
    let script_filename = resolved.fs_path.canonicalize().unwrap_or_else(|_| resolved.fs_path.clone());

    command.env("REQUEST_METHOD", &request.method);
    command.env("QUERY_STRING", &request.query);
    command.env("SCRIPT_NAME", &script_name);
    command.env("SCRIPT_FILENAME", script_filename.as_os_str());
    if !path_info.is_empty() {
        command.env("PATH_INFO", &path_info);
    }
    command.env("SERVER_PROTOCOL", "HTTP/1.1");
    command.env("GATEWAY_INTERFACE", "CGI/1.1");
    command.env("SERVER_NAME", server.server_names.first().map(String::as_str).unwrap_or(&server.host));
    command.env("SERVER_PORT", server.port.to_string());
    command.env("SERVER_SOFTWARE", response::SERVER_BANNER);
    command.env("REMOTE_ADDR", peer.addr.to_string());
    command.env("REMOTE_PORT", peer.port.to_string());

    if let Some(ct) = request.get_header("content-type") {
        command.env("CONTENT_TYPE", ct);
    }
    if let Some(cl) = request.get_header("content-length") {
        command.env("CONTENT_LENGTH", cl);
    }
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let env_name = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        command.env(env_name, value);
    }
}

/// Split the decoded, location-relative path at the first occurrence of the
/// CGI extension: everything up to and including it is `SCRIPT_NAME`
/// (relative to the location prefix), the remainder is `PATH_INFO`.
fn split_script_and_path_info(after_prefix: &str, ext: &str) -> (String, String) {
    if ext.is_empty() {
        return (after_prefix.to_string(), String::new());
    }
    match after_prefix.find(ext) {
        Some(idx) => {
            let split_at = idx + ext.len();
            let (script, info) = after_prefix.split_at(split_at);
            (script.to_string(), info.to_string())
        }
        None => (after_prefix.to_string(), String::new()),
    }
}

/// §4.6 "Response parsing": headers, a blank line, then the body. A missing
/// blank line is 502; a `Status:` header sets the status, otherwise 200.
fn parse_cgi_output(raw: &[u8]) -> Response {
    let (header_end, delimiter_len) = match find(raw, b"\r\n\r\n") {
        Some(p) => (p, 4),
        None => match find(raw, b"\n\n") {
            Some(p) => (p, 2),
            None => return Response::error(502, None),
        },
    };
    let header_block = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let body = raw[header_end + delimiter_len..].to_vec();

    let mut status = 200u16;
    let mut headers = Vec::new();
    for line in header_block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("status") {
                status = value.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(200);
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }
    }

    let mut resp = Response::from_parts(status, headers, body);
    if !resp.has_header("Content-Length") {
        let len = resp.body.len();
        resp.set_header("Content-Length", len.to_string());
    }
    resp
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
