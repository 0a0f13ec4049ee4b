// Single-port bind probe
//
// A probe binds, listens, and immediately drops the socket. It reserves
// nothing: a third party may take the port between a successful probe and the
// real consumer's bind. That window is accepted for test environments.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener};

/// What a bind attempt told us about a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Bind succeeded
    Free,
    /// Something is listening there (`AddrInUse`)
    InUse,
    /// Bind failed for another reason: privileged port, bad host address, ...
    Unbindable(ErrorKind),
}

impl ProbeOutcome {
    pub fn is_free(&self) -> bool {
        matches!(self, ProbeOutcome::Free)
    }
}

/// Attempt an exclusive bind on `(host, port)` and classify the result
pub fn probe(port: u16, host: &str) -> ProbeOutcome {
    let ip: IpAddr = match host.parse() {
        Ok(ip) => ip,
        Err(_) if host == "localhost" => IpAddr::from([127, 0, 0, 1]),
        Err(_) => return ProbeOutcome::Unbindable(ErrorKind::InvalidInput),
    };

    match TcpListener::bind(SocketAddr::new(ip, port)) {
        Ok(listener) => {
            drop(listener);
            ProbeOutcome::Free
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => ProbeOutcome::InUse,
        Err(e) => ProbeOutcome::Unbindable(e.kind()),
    }
}

/// True iff `(host, port)` can be bound right now. Never fails.
pub fn is_available(port: u16, host: &str) -> bool {
    probe(port, host).is_free()
}
