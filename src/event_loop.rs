//! The readiness-driven event loop (§4.8 "EventLoop").
//!
//! Grounded on `Server`/`handle_accept`/`handle_connection` in
//! `other_examples/aa927238_kill-ux-01-server__src-server.rs.rs`: listeners
//! grouped by distinct `(host, port)` pairs, a flat `Token -> Connection`
//! map, accept-until-`WouldBlock`, and re-registering interest based on
//! connection state after each dispatch. `ConfigParser`/`ServerRule`
//! replace that example's `AppConfig`/`ServerConfig`, and connections are
//! driven by [`crate::connection::Connection`] instead of inline
//! `read_data`/`write_data` methods.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config::ServerRule;
use crate::connection::{ConnState, Connection};
use crate::error::ServerError;

/// §4.7 "idle connections are closed after 60 seconds of inactivity".
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const EVENTS_CAPACITY: usize = 1024;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs `SIGINT`/`SIGTERM` handlers that flip [`SHUTDOWN`] and ignores
/// `SIGPIPE`, which would otherwise kill the process on a write to a peer
/// that has already reset the connection.
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
    }
}

/// Owns every listening socket and accepted connection for the process.
pub struct EventLoop {
    poll: Poll,
    listeners: HashMap<Token, (TcpListener, u16)>,
    connections: HashMap<Token, Connection>,
    servers: Arc<Vec<ServerRule>>,
    next_token: usize,
    idle_timeout: Duration,
}

impl EventLoop {
    pub fn new(servers: Vec<ServerRule>) -> Result<EventLoop, ServerError> {
        let poll = Poll::new().map_err(ServerError::Io)?;
        let mut listeners = HashMap::new();
        let mut next_token = 0usize;

        let mut seen_addrs: HashMap<(String, u16), ()> = HashMap::new();
        for server in &servers {
            let key = (server.host.clone(), server.port);
            if seen_addrs.contains_key(&key) {
                continue;
            }
            seen_addrs.insert(key.clone(), ());

            let addr: SocketAddr = format!("{}:{}", server.host, server.port)
                .parse()
                .map_err(|_| ServerError::InvalidHost(server.host.clone(), server.port))?;

            let mut listener = TcpListener::bind(addr).map_err(|e| ServerError::Bind(addr, e))?;
            let token = Token(next_token);
            next_token += 1;
            poll.registry()
                .register(&mut listener, token, Interest::READABLE)
                .map_err(ServerError::Io)?;
            info!("listening on {}", addr);
            listeners.insert(token, (listener, server.port));
        }

        Ok(EventLoop {
            poll,
            listeners,
            connections: HashMap::new(),
            servers: Arc::new(servers),
            next_token,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> EventLoop {
        self.idle_timeout = timeout;
        self
    }

    /// Runs until `SIGINT`/`SIGTERM` is received.
    pub fn run(&mut self) -> Result<(), ServerError> {
        install_signal_handlers();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !SHUTDOWN.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Io(e)),
            }

            for event in events.iter() {
                let token = event.token();
                if self.listeners.contains_key(&token) {
                    self.accept_all(token);
                    continue;
                }

                let mut should_close;
                if let Some(conn) = self.connections.get_mut(&token) {
                    if event.is_readable() && conn.state == ConnState::Reading {
                        conn.handle_readable(&self.servers);
                    }
                    // A completed read can flip state straight to Writing
                    // within this same iteration (the response is ready
                    // before mio has told us the socket is writable); try
                    // the write immediately since it is non-blocking.
                    if conn.state == ConnState::Writing {
                        conn.handle_writable(&self.servers);
                    }
                    should_close = matches!(conn.state, ConnState::Closed | ConnState::Error);
                    if !should_close {
                        let interest = match conn.state {
                            ConnState::Reading => Interest::READABLE,
                            ConnState::Writing => Interest::WRITABLE,
                            _ => Interest::READABLE,
                        };
                        if self.poll.registry().reregister(conn.socket_mut(), token, interest).is_err() {
                            should_close = true;
                        }
                    }
                } else {
                    should_close = false;
                }

                if should_close {
                    if let Some(mut conn) = self.connections.remove(&token) {
                        let _ = self.poll.registry().deregister(conn.socket_mut());
                    }
                }
            }

            self.sweep_idle_connections();
        }

        info!("shutting down");
        Ok(())
    }

    fn accept_all(&mut self, listener_token: Token) {
        let (listener, accepted_port) = match self.listeners.get(&listener_token) {
            Some(pair) => pair,
            None => return,
        };
        let accepted_port = *accepted_port;

        loop {
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let max_body_size = self
                        .servers
                        .iter()
                        .filter(|s| s.port == accepted_port)
                        .map(|s| s.client_max_body_size)
                        .max()
                        .unwrap_or(u64::MAX);

                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .is_err()
                    {
                        continue;
                    }

                    debug!("accepted {} on port {}", peer_addr, accepted_port);
                    let conn = Connection::new(stream, peer_addr.ip(), peer_addr.port(), accepted_port, max_body_size);
                    self.connections.insert(token, conn);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn sweep_idle_connections(&mut self) {
        let timeout = self.idle_timeout;
        let stale: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_idle_past(timeout))
            .map(|(token, _)| *token)
            .collect();

        for token in stale {
            if let Some(mut conn) = self.connections.remove(&token) {
                debug!("closing idle connection from {}", conn.peer_addr);
                let _ = self.poll.registry().deregister(conn.socket_mut());
            }
        }
    }
}
