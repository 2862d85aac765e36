//! Loopback listener that feeds local connections into a tunnel's relay session.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::Context;
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use crate::relaytun::{
    net,
    tunnel::{
        client::RelayTunnelClient,
        error::TunnelError,
        policy::{ConnectionPolicy, PeerInfo, PeerResolver},
        protocol::MAX_DATA_PAYLOAD,
        session::RelaySessions,
        target::Target,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalPort {
    #[default]
    Ephemeral,
    /// Derived from the target; ephemeral when the derived port is taken.
    Stable,
    Fixed(u16),
}

impl FromStr for LocalPort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "ephemeral" | "0" => Ok(LocalPort::Ephemeral),
            "stable" => Ok(LocalPort::Stable),
            other => {
                let p: u16 = other
                    .parse()
                    .with_context(|| format!("listener: bad local_port {other:?}"))?;
                Ok(LocalPort::Fixed(p))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub bind_ip: IpAddr,
    pub port: LocalPort,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: LocalPort::Ephemeral,
        }
    }
}

#[derive(Debug, Default)]
struct EndpointStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// A bound loopback socket plus its accept task.
#[derive(Debug)]
pub struct LocalEndpoint {
    addr: SocketAddr,
    stop: CancellationToken,
    stats: Arc<EndpointStats>,
}

impl LocalEndpoint {
    /// Binds the listener and starts accepting. The accept task stops when `cancel` fires or
    /// [`LocalEndpoint::stop`] is called.
    pub async fn bind(
        target: &Target,
        opts: &EndpointOptions,
        policy: Arc<dyn ConnectionPolicy>,
        resolver: Arc<dyn PeerResolver>,
        sessions: Arc<RelaySessions>,
        cancel: CancellationToken,
    ) -> Result<Self, TunnelError> {
        if !opts.bind_ip.is_loopback() {
            return Err(TunnelError::LocalEndpoint(format!(
                "refusing to listen on non-loopback address {}",
                opts.bind_ip
            )));
        }
        let preferred = match opts.port {
            LocalPort::Ephemeral => 0,
            LocalPort::Stable => net::stable_port(target),
            LocalPort::Fixed(p) => p,
        };
        let ln = match opts.port {
            LocalPort::Fixed(p) => TcpListener::bind(SocketAddr::new(opts.bind_ip, p)).await,
            _ => net::bind_preferring(opts.bind_ip, preferred).await,
        }
        .map_err(|err| TunnelError::LocalEndpoint(format!("bind {}:{preferred}: {err}", opts.bind_ip)))?;
        let addr = ln
            .local_addr()
            .map_err(|err| TunnelError::LocalEndpoint(err.to_string()))?;

        let stop = cancel.child_token();
        let stats = Arc::new(EndpointStats::default());
        let accept = AcceptLoop {
            ln,
            addr,
            target: target.clone(),
            policy,
            resolver,
            sessions,
            active: Arc::new(AtomicBool::new(false)),
            stats: stats.clone(),
            stop: stop.clone(),
        };
        tokio::spawn(accept.run());

        tracing::info!(target=%target, local=%addr, "listener: listening");
        Ok(Self { addr, stop, stats })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }

    /// Local connections closed because of policy or because the tunnel was busy.
    pub fn rejected(&self) -> u64 {
        self.stats.rejected.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct AcceptLoop {
    ln: TcpListener,
    addr: SocketAddr,
    target: Target,
    policy: Arc<dyn ConnectionPolicy>,
    resolver: Arc<dyn PeerResolver>,
    sessions: Arc<RelaySessions>,
    active: Arc<AtomicBool>,
    stats: Arc<EndpointStats>,
    stop: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        let this = Arc::new(self);
        loop {
            tokio::select! {
                _ = this.stop.cancelled() => break,
                r = this.ln.accept() => {
                    let (sock, peer) = match r {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(target=%this.target, err=%err, "listener: accept failed");
                            continue;
                        }
                    };
                    let this = this.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.serve(sock, peer).await {
                            tracing::debug!(target=%this.target, peer=%peer, err=%err, "listener: local connection ended");
                        }
                    });
                }
            }
        }
        tracing::debug!(target=%this.target, local=%this.addr, "listener: stopped");
    }

    async fn serve(&self, sock: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let info = self.peer_info(peer).await;
        if !self.policy.permits(&info) {
            self.reject("policy");
            let err = TunnelError::LocalPolicyDenied(self.policy.name().to_string());
            tracing::warn!(
                target=%self.target,
                peer=%peer,
                pid=?info.pid,
                uid=?info.uid,
                err=%err,
                "listener: local connection rejected"
            );
            return Ok(());
        }

        let Some(_leg) = LegGuard::try_take(&self.active) else {
            self.reject("busy");
            tracing::warn!(target=%self.target, peer=%peer, "listener: tunnel already serves a local connection; rejected");
            return Ok(());
        };
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        sock.set_nodelay(true).ok();

        let client = self.sessions.acquire().await?;
        tracing::info!(
            target=%self.target,
            peer=%peer,
            session=%client.session_id(),
            "listener: local connection attached"
        );
        let res = pump(sock, &client, &self.stop).await;
        self.sessions.release(&client).await;
        res
    }

    async fn peer_info(&self, peer: SocketAddr) -> PeerInfo {
        if !self.policy.needs_owner() {
            return PeerInfo::addr_only(peer);
        }
        let resolver = self.resolver.clone();
        let local = self.addr;
        tokio::task::spawn_blocking(move || resolver.resolve(peer, local))
            .await
            .unwrap_or_else(|_| PeerInfo::addr_only(peer))
    }

    fn reject(&self, why: &'static str) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relaytun_local_rejections_total", "reason" => why).increment(1);
    }
}

/// Held while a local connection is attached.
struct LegGuard(Arc<AtomicBool>);

impl LegGuard {
    fn try_take(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for LegGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Copies bytes both ways until either side ends.
async fn pump(
    sock: TcpStream,
    client: &RelayTunnelClient,
    stop: &CancellationToken,
) -> anyhow::Result<()> {
    let (mut rd, mut wr) = sock.into_split();

    let upstream = async {
        let mut buf = BytesMut::with_capacity(MAX_DATA_PAYLOAD);
        loop {
            buf.reserve(MAX_DATA_PAYLOAD);
            let n = rd.read_buf(&mut buf).await.context("listener: local read")?;
            if n == 0 {
                return Ok::<(), anyhow::Error>(());
            }
            client.send(buf.split().freeze()).await?;
        }
    };

    let downstream = async {
        loop {
            match client.recv().await? {
                Some(b) => wr.write_all(&b).await.context("listener: local write")?,
                None => {
                    let _ = wr.shutdown().await;
                    return Ok::<(), anyhow::Error>(());
                }
            }
        }
    };

    tokio::select! {
        r = upstream => r,
        r = downstream => r,
        _ = stop.cancelled() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::relaytun::tunnel::{
        client::{SessionContext, TrafficCounters},
        credential::StaticToken,
        policy::{AddressOnly, AnyLocalProcess, CurrentUser},
        session::LegClose,
        testing::{MockRelay, RelayPlan, eventually, fast_options},
    };

    fn target() -> Target {
        Target::new("proj-1", "zone-1", "vm-1", 3389)
    }

    async fn endpoint(
        relay: &MockRelay,
        policy: Arc<dyn ConnectionPolicy>,
    ) -> (LocalEndpoint, Arc<RelaySessions>) {
        let (events, _) = broadcast::channel(16);
        let ctx = SessionContext {
            target: target(),
            dialer: relay.dialer(),
            credentials: Arc::new(StaticToken::new("t")),
            options: fast_options(),
            counters: Arc::new(TrafficCounters::default()),
            events,
        };
        let cancel = CancellationToken::new();
        let first = RelayTunnelClient::connect(ctx.clone(), &cancel).await.unwrap();
        let sessions = RelaySessions::new(ctx, LegClose::CloseSession, first, cancel.clone());
        let ep = LocalEndpoint::bind(
            &target(),
            &EndpointOptions::default(),
            policy,
            Arc::new(AddressOnly),
            sessions.clone(),
            cancel,
        )
        .await
        .unwrap();
        (ep, sessions)
    }

    #[test]
    fn local_port_parses() {
        assert_eq!("".parse::<LocalPort>().unwrap(), LocalPort::Ephemeral);
        assert_eq!("stable".parse::<LocalPort>().unwrap(), LocalPort::Stable);
        assert_eq!("13389".parse::<LocalPort>().unwrap(), LocalPort::Fixed(13389));
        assert!("many".parse::<LocalPort>().is_err());
    }

    #[tokio::test]
    async fn refuses_non_loopback_bind() {
        let relay = MockRelay::new(RelayPlan::default());
        let (_ep, sessions) = endpoint(&relay, Arc::new(AnyLocalProcess)).await;
        let opts = EndpointOptions {
            bind_ip: "0.0.0.0".parse().unwrap(),
            port: LocalPort::Ephemeral,
        };
        let err = LocalEndpoint::bind(
            &target(),
            &opts,
            Arc::new(AnyLocalProcess),
            Arc::new(AddressOnly),
            sessions,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::LocalEndpoint(_)), "{err:?}");
    }

    #[tokio::test]
    async fn pumps_both_directions() {
        let relay = MockRelay::new(RelayPlan {
            echo: true,
            ..RelayPlan::default()
        });
        let (ep, _sessions) = endpoint(&relay, Arc::new(AnyLocalProcess)).await;
        assert!(ep.local_addr().ip().is_loopback());

        let mut c = TcpStream::connect(ep.local_addr()).await.unwrap();
        c.write_all(b"ping over relay").await.unwrap();
        let mut got = vec![0u8; 15];
        tokio::time::timeout(Duration::from_secs(5), c.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"ping over relay");
        assert_eq!(relay.received("S1"), b"ping over relay");
        assert_eq!(ep.accepted(), 1);
    }

    #[tokio::test]
    async fn policy_denial_closes_socket_before_relay_traffic() {
        let relay = MockRelay::new(RelayPlan::default());
        // No owner information is resolved, so a current-user policy must deny.
        let (ep, _sessions) = endpoint(&relay, Arc::new(CurrentUser::default())).await;

        let mut c = TcpStream::connect(ep.local_addr()).await.unwrap();
        let _ = c.write_all(b"secret").await;
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        eventually("rejection counted", || ep.rejected() == 1).await;
        assert_eq!(relay.total_received(), 0);
    }

    #[tokio::test]
    async fn second_concurrent_connection_is_rejected() {
        let relay = MockRelay::new(RelayPlan {
            echo: true,
            ..RelayPlan::default()
        });
        let (ep, _sessions) = endpoint(&relay, Arc::new(AnyLocalProcess)).await;

        let mut first = TcpStream::connect(ep.local_addr()).await.unwrap();
        first.write_all(b"a").await.unwrap();
        let mut one = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(5), first.read_exact(&mut one))
            .await
            .unwrap()
            .unwrap();

        let mut second = TcpStream::connect(ep.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(ep.rejected(), 1);
    }

    #[tokio::test]
    async fn next_leg_gets_fresh_session_after_close() {
        let relay = MockRelay::new(RelayPlan {
            echo: true,
            ..RelayPlan::default()
        });
        let (ep, sessions) = endpoint(&relay, Arc::new(AnyLocalProcess)).await;

        let mut c = TcpStream::connect(ep.local_addr()).await.unwrap();
        c.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        c.read_exact(&mut one).await.unwrap();
        drop(c);
        eventually("first session closed", || sessions.status().is_none()).await;

        let mut c = TcpStream::connect(ep.local_addr()).await.unwrap();
        c.write_all(b"y").await.unwrap();
        c.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"y");
        assert_eq!(relay.handshakes(), 2);
        assert_eq!(relay.received("S2"), b"y");
    }

    #[tokio::test]
    async fn stop_closes_listener() {
        let relay = MockRelay::new(RelayPlan::default());
        let (ep, _sessions) = endpoint(&relay, Arc::new(AnyLocalProcess)).await;
        let addr = ep.local_addr();
        ep.stop();
        let mut refused = false;
        for _ in 0..100 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);
    }
}
