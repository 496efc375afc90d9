//! Well-known local service destinations for OPEN.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Service {
    /// `shell:` with an optional command; interactive when empty.
    Shell(String),
    /// `exec:` raw command execution without a pty.
    Exec(String),
    /// `sync:` file transfer service.
    Sync,
    /// `tcpip:` restart adbd listening on a TCP port.
    Tcpip(u16),
    /// `reboot:` with an optional target such as `bootloader` or `recovery`.
    Reboot(String),
    /// Any other destination, passed through verbatim.
    Raw(String),
}

impl Service {
    pub fn destination(&self) -> String {
        match self {
            Service::Shell(cmd) => format!("shell:{cmd}"),
            Service::Exec(cmd) => format!("exec:{cmd}"),
            Service::Sync => "sync:".to_string(),
            Service::Tcpip(port) => format!("tcpip:{port}"),
            Service::Reboot(target) => format!("reboot:{target}"),
            Service::Raw(dest) => dest.clone(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}

impl From<&str> for Service {
    fn from(dest: &str) -> Self {
        Service::Raw(dest.to_string())
    }
}
