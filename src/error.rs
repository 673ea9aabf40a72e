//! Top-level error type for startup failures (§4.8, §7 "exit codes").
//!
//! Grounded on the `quick_error!` taxonomy already used in
//! [`crate::config`], kept consistent across the crate rather than
//! introducing a second error-handling convention for the binary.

use std::io;
use std::net::SocketAddr;

use quick_error::quick_error;

use crate::config::ConfigParseError;

quick_error! {
    #[derive(Debug)]
    pub enum ServerError {
        Config(e: ConfigParseError) {
            from()
            display("{}", e)
        }
        Bind(addr: SocketAddr, e: io::Error) {
            display("failed to bind {}: {}", addr, e)
        }
        InvalidHost(host: String, port: u16) {
            display("invalid listen address {}:{}", host, port)
        }
        Io(e: io::Error) {
            from()
            display("{}", e)
        }
    }
}
