//! Which local processes may use a tunnel's loopback listener.

use std::{
    fmt,
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

/// What is known about the process on the other end of an accepted local socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub pid: Option<u32>,
    pub uid: Option<u32>,
}

impl PeerInfo {
    pub fn addr_only(addr: SocketAddr) -> Self {
        Self {
            addr,
            pid: None,
            uid: None,
        }
    }
}

pub trait ConnectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn permits(&self, peer: &PeerInfo) -> bool;

    /// Whether `permits` looks at the owning process at all.
    fn needs_owner(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionPolicy({})", self.name())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnyLocalProcess;

impl ConnectionPolicy for AnyLocalProcess {
    fn name(&self) -> &'static str {
        "any"
    }

    fn permits(&self, peer: &PeerInfo) -> bool {
        peer.addr.ip().to_canonical().is_loopback()
    }

    fn needs_owner(&self) -> bool {
        false
    }
}

/// Only sockets opened by this very process.
#[derive(Debug, Clone, Copy)]
pub struct CurrentProcess {
    pid: u32,
}

impl Default for CurrentProcess {
    fn default() -> Self {
        Self {
            pid: std::process::id(),
        }
    }
}

impl ConnectionPolicy for CurrentProcess {
    fn name(&self) -> &'static str {
        "process"
    }

    fn permits(&self, peer: &PeerInfo) -> bool {
        peer.pid == Some(self.pid)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CurrentUser {
    uid: Option<u32>,
}

impl Default for CurrentUser {
    fn default() -> Self {
        Self { uid: current_uid() }
    }
}

impl ConnectionPolicy for CurrentUser {
    fn name(&self) -> &'static str {
        "user"
    }

    fn permits(&self, peer: &PeerInfo) -> bool {
        match (self.uid, peer.uid) {
            (Some(me), Some(them)) => me == them,
            _ => false,
        }
    }
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    Some(nix::unistd::geteuid().as_raw())
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    Any,
    Process,
    User,
}

impl PolicyKind {
    pub fn build(self) -> Arc<dyn ConnectionPolicy> {
        match self {
            PolicyKind::Any => Arc::new(AnyLocalProcess),
            PolicyKind::Process => Arc::new(CurrentProcess::default()),
            PolicyKind::User => Arc::new(CurrentUser::default()),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "any" => Ok(PolicyKind::Any),
            "process" | "current_process" => Ok(PolicyKind::Process),
            "user" | "current_user" => Ok(PolicyKind::User),
            other => anyhow::bail!("policy: unknown connection policy {other:?} (expected any|process|user)"),
        }
    }
}

/// Maps an accepted local socket to its owning process.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, peer: SocketAddr, local: SocketAddr) -> PeerInfo;
}

/// Resolves socket owners through procfs: the uid and inode from `net/tcp{,6}`, the pid by
/// finding the process holding `socket:[inode]`.
#[derive(Debug, Clone)]
pub struct ProcfsResolver {
    root: PathBuf,
}

impl Default for ProcfsResolver {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn find_socket(&self, peer: SocketAddr, local: SocketAddr) -> Option<(u32, u64)> {
        for table in ["net/tcp", "net/tcp6"] {
            let Ok(text) = fs::read_to_string(self.root.join(table)) else {
                continue;
            };
            for line in text.lines().skip(1) {
                let Some(entry) = parse_tcp_line(line) else {
                    continue;
                };
                if same_endpoint(entry.local, peer) && same_endpoint(entry.remote, local) {
                    return Some((entry.uid, entry.inode));
                }
            }
        }
        None
    }

    fn find_pid(&self, inode: u64) -> Option<u32> {
        let want = format!("socket:[{inode}]");
        let procs = fs::read_dir(&self.root).ok()?;
        for p in procs.flatten() {
            let Some(pid) = p.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(p.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if link.as_os_str() == want.as_str() {
                        return Some(pid);
                    }
                }
            }
        }
        None
    }
}

impl PeerResolver for ProcfsResolver {
    fn resolve(&self, peer: SocketAddr, local: SocketAddr) -> PeerInfo {
        let Some((uid, inode)) = self.find_socket(peer, local) else {
            return PeerInfo::addr_only(peer);
        };
        // Inode 0 means the socket is already gone (TIME_WAIT and friends).
        let pid = if inode == 0 { None } else { self.find_pid(inode) };
        PeerInfo {
            addr: peer,
            pid,
            uid: Some(uid),
        }
    }
}

/// Knows nothing beyond the socket address.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressOnly;

impl PeerResolver for AddressOnly {
    fn resolve(&self, peer: SocketAddr, _local: SocketAddr) -> PeerInfo {
        PeerInfo::addr_only(peer)
    }
}

pub fn default_resolver() -> Arc<dyn PeerResolver> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcfsResolver::default())
    } else {
        Arc::new(AddressOnly)
    }
}

struct TcpEntry {
    local: SocketAddr,
    remote: SocketAddr,
    uid: u32,
    inode: u64,
}

fn parse_tcp_line(line: &str) -> Option<TcpEntry> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 10 {
        return None;
    }
    Some(TcpEntry {
        local: parse_hex_endpoint(cols[1])?,
        remote: parse_hex_endpoint(cols[2])?,
        uid: cols[7].parse().ok()?,
        inode: cols[9].parse().ok()?,
    })
}

/// `0100007F:1F90` style endpoints: address words in host byte order, port big-endian.
fn parse_hex_endpoint(s: &str) -> Option<SocketAddr> {
    let (addr, port) = s.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => {
            let w = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(w.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for i in 0..4 {
                let w = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                octets[i * 4..i * 4 + 4].copy_from_slice(&w.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && a.ip().to_canonical() == b.ip().to_canonical()
}
