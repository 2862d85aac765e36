use std::{borrow::Cow, net::SocketAddr};

use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

use crate::relaytun::tunnel::target::Target;

/// First port handed out by [`stable_port`]. Stays below the usual ephemeral range so a
/// derived port rarely collides with outgoing connections.
const STABLE_PORT_MIN: u16 = 20000;
const STABLE_PORT_MAX: u16 = 49151;

/// Normalize a bind/listen address.
///
/// The config accepts the shorthand `":PORT"`; for a tunnel's local side and the admin
/// server that means loopback, so it becomes `"127.0.0.1:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("127.0.0.1{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// A port derived from the target, so that the same VM gets the same local port across runs
/// and saved client profiles keep working.
pub fn stable_port(target: &Target) -> u16 {
    let mut h = Sha256::new();
    h.update(target.project_id.as_bytes());
    h.update([0]);
    h.update(target.zone.as_bytes());
    h.update([0]);
    h.update(target.instance.as_bytes());
    h.update([0]);
    h.update(target.port.to_be_bytes());
    let d = h.finalize();
    let span = u32::from(STABLE_PORT_MAX - STABLE_PORT_MIN) + 1;
    let n = u32::from_be_bytes([d[0], d[1], d[2], d[3]]) % span;
    STABLE_PORT_MIN + n as u16
}

/// Binds `ip:preferred`, falling back to an ephemeral port when it is taken.
pub async fn bind_preferring(ip: std::net::IpAddr, preferred: u16) -> std::io::Result<TcpListener> {
    if preferred != 0 {
        match TcpListener::bind(SocketAddr::new(ip, preferred)).await {
            Ok(ln) => return Ok(ln),
            Err(err) => {
                tracing::debug!(port = preferred, err=%err, "net: preferred port unavailable; using ephemeral");
            }
        }
    }
    TcpListener::bind(SocketAddr::new(ip, 0)).await
}
