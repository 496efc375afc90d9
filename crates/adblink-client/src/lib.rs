//! adblink client -- ADB connections, streams and pairing over TCP or USB.
//!
//! Re-exports the types callers need so the CLI and integration tests can
//! drive a connection without reaching into submodules.

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod pairing;
pub mod stream;
pub mod transport;

use std::path::PathBuf;

pub use config::AdbConfig;
pub use connection::{AdbConnection, ConnectionOptions, Phase};
pub use error::{AdbError, PairingError, TransportError};
pub use manager::ConnectionManager;
pub use pairing::{PairingClient, PairingState};
pub use stream::{AdbStream, FlowControl, WriteCredit};
pub use transport::{BoxedIo, Channel, TcpChannel, UsbChannel, UsbDeviceSummary};

/// Default port of adbd in TCP mode.
pub const DEFAULT_ADB_PORT: u16 = 5555;

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Split `host[:port]`, defaulting the port to 5555. Bracketed IPv6
/// literals (`[::1]:5555`) are accepted.
pub fn parse_host_port(addr: &str) -> Option<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => DEFAULT_ADB_PORT,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Some((host.to_string(), port.parse().ok()?))
        }
        Some(_) => Some((addr.to_string(), DEFAULT_ADB_PORT)),
        None => Some((addr.to_string(), DEFAULT_ADB_PORT)),
    }
}
