//! CLI entry point: `webserv [config_file]` (§6 "CLI").
//!
//! Grounded on the sibling fork `swindon-rs-tk-http`'s `src/bin/curl.rs`
//! (`env_logger::init()` first thing in `main`, plain `std::process::exit`
//! on failure), since the teacher's own examples never ship a binary of
//! their own. Returns a proper process exit code on configuration or bind
//! failure instead of panicking.

use std::path::PathBuf;

use webserv::config::ConfigParser;
use webserv::event_loop::EventLoop;

const DEFAULT_CONFIG_PATH: &str = "config/default.conf";

fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let servers = match ConfigParser::load(&config_path) {
        Ok(servers) => servers,
        Err(e) => {
            log::error!("failed to load {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    let mut event_loop = match EventLoop::new(servers) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = event_loop.run() {
        log::error!("server error: {}", e);
        std::process::exit(1);
    }
}
