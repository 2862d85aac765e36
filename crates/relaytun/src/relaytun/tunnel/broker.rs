//! Registry of tunnels keyed by target.
//!
//! The broker hands out [`TunnelHandle`]s. Concurrent connects for the same target share one
//! relay session and one local endpoint; each handle is a lease, and a tunnel without leases
//! is torn down after the idle grace period.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex, OnceLock, Weak},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::relaytun::{
    telemetry,
    tunnel::{
        client::{AckState, ClientOptions, RelayTunnelClient, SessionContext, TrafficCounters, TunnelEvent},
        credential::CredentialSource,
        error::{CloseReason, TunnelError},
        listener::{EndpointOptions, LocalEndpoint},
        policy::{ConnectionPolicy, PeerResolver, default_resolver},
        session::{LegClose, RelaySessions},
        target::Target,
        transport::RelayDialer,
    },
};

const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub client: ClientOptions,
    /// How long a tunnel without leases stays up in case it is needed again.
    pub idle_grace: Duration,
    pub leg_close: LegClose,
    pub endpoint: EndpointOptions,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            idle_grace: Duration::from_secs(30),
            leg_close: LegClose::CloseSession,
            endpoint: EndpointOptions::default(),
        }
    }
}

type Outcome = Option<Result<(), TunnelError>>;

enum Slot {
    Pending {
        policy: &'static str,
        done: watch::Receiver<Outcome>,
    },
    Live {
        tunnel: Arc<Tunnel>,
        leases: usize,
        // Bumped on every lease change; an idle timer only fires for the epoch it was armed in.
        idle_epoch: u64,
    },
}

struct Inner {
    dialer: Arc<dyn RelayDialer>,
    credentials: Arc<dyn CredentialSource>,
    resolver: Arc<dyn PeerResolver>,
    opts: BrokerOptions,
    registry: StdMutex<HashMap<Target, Slot>>,
    events: broadcast::Sender<TunnelEvent>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct TunnelBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TunnelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelBroker")
            .field("transport", &self.inner.dialer.name())
            .finish_non_exhaustive()
    }
}

enum Step {
    Ready(Arc<Tunnel>),
    Wait(watch::Receiver<Outcome>),
    Create(watch::Sender<Outcome>, watch::Receiver<Outcome>),
}

impl TunnelBroker {
    pub fn new(
        dialer: Arc<dyn RelayDialer>,
        credentials: Arc<dyn CredentialSource>,
        opts: BrokerOptions,
    ) -> Self {
        Self::with_resolver(dialer, credentials, default_resolver(), opts)
    }

    pub fn with_resolver(
        dialer: Arc<dyn RelayDialer>,
        credentials: Arc<dyn CredentialSource>,
        resolver: Arc<dyn PeerResolver>,
        opts: BrokerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            inner: Arc::new(Inner {
                dialer,
                credentials,
                resolver,
                opts,
                registry: StdMutex::new(HashMap::new()),
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Returns a lease on the tunnel for `target`, creating it if needed.
    ///
    /// A zero `timeout` waits for as long as the relay handshake and its retries take.
    pub async fn connect(
        &self,
        target: Target,
        policy: Arc<dyn ConnectionPolicy>,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelError> {
        let tunnel = self.acquire_within(target, policy, timeout).await?;
        Ok(self.handle(tunnel))
    }

    /// Like [`TunnelBroker::connect`]. Cancelling `cancel` aborts a pending connect, and
    /// later closes the tunnel and its listener.
    pub async fn connect_with_cancel(
        &self,
        target: Target,
        policy: Arc<dyn ConnectionPolicy>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError> {
        let tunnel = tokio::select! {
            r = self.acquire_within(target, policy, timeout) => r?,
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
        };

        let weak = Arc::downgrade(&self.inner);
        let t = tunnel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.unregister(&t);
                    }
                    t.close(CloseReason::Cancelled).await;
                }
                _ = t.cancel.cancelled() => {}
            }
        });
        Ok(self.handle(tunnel))
    }

    /// Gives up a lease. Same as dropping the handle.
    pub fn disconnect(&self, handle: TunnelHandle) {
        drop(handle);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let reg = self.inner.lock();
        let mut out: Vec<TunnelSnapshot> = reg
            .iter()
            .map(|(target, slot)| match slot {
                Slot::Pending { policy, .. } => TunnelSnapshot::pending(target, *policy),
                Slot::Live { tunnel, leases, .. } => tunnel.snapshot(*leases),
            })
            .collect();
        drop(reg);
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    /// Closes every tunnel. Connects still in flight fail with `Cancelled`.
    pub async fn shutdown(&self) {
        let tunnels: Vec<Arc<Tunnel>> = {
            let mut reg = self.inner.lock();
            reg.drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live { tunnel, .. } => Some(tunnel),
                    Slot::Pending { .. } => None,
                })
                .collect()
        };
        tracing::info!(tunnels = tunnels.len(), "broker: shutting down");
        futures_util::future::join_all(tunnels.iter().map(|t| t.close(CloseReason::LocalClosed))).await;
        self.inner.cancel.cancel();
    }

    fn handle(&self, tunnel: Arc<Tunnel>) -> TunnelHandle {
        TunnelHandle {
            tunnel,
            broker: Arc::downgrade(&self.inner),
        }
    }

    async fn acquire_within(
        &self,
        target: Target,
        policy: Arc<dyn ConnectionPolicy>,
        timeout: Duration,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        target
            .validate()
            .map_err(|err| TunnelError::TargetNotFound(err.to_string()))?;
        if timeout.is_zero() {
            return self.acquire(target, policy).await;
        }
        tokio::time::timeout(timeout, self.acquire(target, policy))
            .await
            .map_err(|_| TunnelError::ConnectTimeout(timeout))?
    }

    async fn acquire(
        &self,
        target: Target,
        policy: Arc<dyn ConnectionPolicy>,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let inner = &self.inner;
        loop {
            if inner.cancel.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }
            let step = {
                let mut reg = inner.lock();
                match reg.get_mut(&target) {
                    Some(Slot::Live {
                        tunnel,
                        leases,
                        idle_epoch,
                    }) => {
                        conflict(&target, tunnel.policy.name(), policy.name())?;
                        *leases += 1;
                        *idle_epoch += 1;
                        Step::Ready(tunnel.clone())
                    }
                    Some(Slot::Pending { policy: p, done }) => {
                        conflict(&target, *p, policy.name())?;
                        Step::Wait(done.clone())
                    }
                    None => {
                        let (tx, rx) = watch::channel(None);
                        reg.insert(
                            target.clone(),
                            Slot::Pending {
                                policy: policy.name(),
                                done: rx.clone(),
                            },
                        );
                        Step::Create(tx, rx)
                    }
                }
            };

            match step {
                Step::Ready(t) => {
                    tracing::debug!(target=%target, "broker: reusing tunnel");
                    return Ok(t);
                }
                Step::Wait(mut done) => {
                    let outcome = match done.wait_for(|v| v.is_some()).await {
                        Ok(v) => (*v).clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        // The tunnel is registered now; loop around to take a lease on it.
                        Some(Ok(())) => continue,
                        Some(Err(err)) => return Err(err),
                        // The creating caller went away.
                        None => {
                            inner.clear_pending(&target, &done);
                            continue;
                        }
                    }
                }
                Step::Create(tx, rx) => {
                    let mut guard = PendingGuard {
                        inner: inner.as_ref(),
                        target: &target,
                        done: rx,
                        armed: true,
                    };
                    let res = inner.create(&target, policy.clone()).await;
                    guard.armed = false;
                    return match res {
                        Ok(tunnel) => {
                            {
                                let mut reg = inner.lock();
                                reg.insert(
                                    target.clone(),
                                    Slot::Live {
                                        tunnel: tunnel.clone(),
                                        leases: 1,
                                        idle_epoch: 0,
                                    },
                                );
                            }
                            tx.send_replace(Some(Ok(())));
                            inner.watch_terminal(tunnel.clone());
                            inner.emit(TunnelEvent::Created {
                                target: target.clone(),
                                local_endpoint: tunnel.local_addr(),
                            });
                            Ok(tunnel)
                        }
                        Err(err) => {
                            inner.clear_pending(&target, &guard.done);
                            tx.send_replace(Some(Err(err.clone())));
                            tracing::warn!(target=%target, err=%err, "broker: tunnel creation failed");
                            Err(err)
                        }
                    };
                }
            }
        }
    }
}

fn conflict(target: &Target, existing: &'static str, requested: &'static str) -> Result<(), TunnelError> {
    if existing == requested {
        return Ok(());
    }
    Err(TunnelError::PolicyConflict {
        target: target.to_string(),
        existing,
        requested,
    })
}

/// Removes the `Pending` slot of an abandoned creation.
struct PendingGuard<'a> {
    inner: &'a Inner,
    target: &'a Target,
    done: watch::Receiver<Outcome>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.clear_pending(self.target, &self.done);
        }
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Target, Slot>> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, ev: TunnelEvent) {
        let _ = self.events.send(ev);
    }

    fn clear_pending(&self, target: &Target, done: &watch::Receiver<Outcome>) {
        let mut reg = self.lock();
        if let Some(Slot::Pending { done: d, .. }) = reg.get(target) {
            if d.same_channel(done) {
                reg.remove(target);
            }
        }
    }

    fn unregister(&self, tunnel: &Arc<Tunnel>) {
        let mut reg = self.lock();
        if let Some(Slot::Live { tunnel: t, .. }) = reg.get(&tunnel.target) {
            if Arc::ptr_eq(t, tunnel) {
                reg.remove(&tunnel.target);
            }
        }
    }

    async fn create(
        &self,
        target: &Target,
        policy: Arc<dyn ConnectionPolicy>,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let cancel = self.cancel.child_token();
        // Dropping out of here early (failure, caller cancellation) tears down whatever exists.
        let guard = cancel.clone().drop_guard();

        let counters = Arc::new(TrafficCounters::default());
        let ctx = SessionContext {
            target: target.clone(),
            dialer: self.dialer.clone(),
            credentials: self.credentials.clone(),
            options: self.opts.client.clone(),
            counters: counters.clone(),
            events: self.events.clone(),
        };
        let first = RelayTunnelClient::connect(ctx.clone(), &cancel).await?;
        let sessions = RelaySessions::new(ctx, self.opts.leg_close, first, cancel.clone());
        let endpoint = LocalEndpoint::bind(
            target,
            &self.opts.endpoint,
            policy.clone(),
            self.resolver.clone(),
            sessions.clone(),
            cancel.clone(),
        )
        .await?;

        if self.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        guard.disarm();
        telemetry::tunnel_opened();
        tracing::info!(
            target=%target,
            local=%endpoint.local_addr(),
            policy=policy.name(),
            transport=self.dialer.name(),
            "broker: tunnel created"
        );
        Ok(Arc::new(Tunnel {
            target: target.clone(),
            policy,
            endpoint,
            sessions,
            counters,
            cancel,
            events: self.events.clone(),
            created_at_unix_ms: telemetry::now_unix_ms(),
            closed: OnceLock::new(),
        }))
    }

    fn release(self: Arc<Self>, tunnel: &Arc<Tunnel>) {
        let epoch = {
            let mut reg = self.lock();
            match reg.get_mut(&tunnel.target) {
                Some(Slot::Live {
                    tunnel: t,
                    leases,
                    idle_epoch,
                }) if Arc::ptr_eq(t, tunnel) => {
                    *leases = leases.saturating_sub(1);
                    *idle_epoch += 1;
                    if *leases > 0 {
                        return;
                    }
                    *idle_epoch
                }
                _ => return,
            }
        };

        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            self.unregister(tunnel);
            tunnel.cancel.cancel();
            return;
        };
        let tunnel = tunnel.clone();
        let grace = self.opts.idle_grace;
        tracing::debug!(
            target=%tunnel.target,
            "broker: no leases left; closing in {}",
            humantime::format_duration(grace)
        );
        rt.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = tunnel.cancel.cancelled() => return,
            }
            let expired = {
                let mut reg = self.lock();
                match reg.get(&tunnel.target) {
                    Some(Slot::Live {
                        tunnel: t,
                        leases: 0,
                        idle_epoch,
                    }) if Arc::ptr_eq(t, &tunnel) && *idle_epoch == epoch => {
                        reg.remove(&tunnel.target);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                tunnel.close(CloseReason::IdleTimeout).await;
            }
        });
    }

    fn watch_terminal(self: &Arc<Self>, tunnel: Arc<Tunnel>) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let fatal = tunnel.sessions.fatal();
        tokio::spawn(async move {
            tokio::select! {
                _ = fatal.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.unregister(&tunnel);
                    }
                    let reason = tunnel
                        .sessions
                        .terminal_reason()
                        .unwrap_or_else(|| CloseReason::failed(TunnelError::Cancelled));
                    tunnel.close(reason).await;
                }
                _ = tunnel.cancel.cancelled() => {}
            }
        });
    }
}

/// One target's relay sessions plus its local endpoint.
pub struct Tunnel {
    target: Target,
    policy: Arc<dyn ConnectionPolicy>,
    endpoint: LocalEndpoint,
    sessions: Arc<RelaySessions>,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
    created_at_unix_ms: u64,
    closed: OnceLock<CloseReason>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &self.target)
            .field("local", &self.endpoint.local_addr())
            .field("policy", &self.policy.name())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.get()
    }

    /// `closed`, `idle` (between local connections), or the current session's state.
    pub fn state_name(&self) -> &'static str {
        if self.closed.get().is_some() {
            return "closed";
        }
        match self.sessions.status() {
            Some(s) => s.state.name(),
            None => "idle",
        }
    }

    fn snapshot(&self, leases: usize) -> TunnelSnapshot {
        let status = self.sessions.status();
        let c = &self.counters;
        TunnelSnapshot {
            target: self.target.to_string(),
            local_endpoint: Some(self.local_addr().to_string()),
            policy: self.policy.name(),
            state: self.state_name(),
            leases,
            session_id: status.as_ref().map(|s| s.session_id.clone()),
            ack: status.map(|s| s.ack),
            bytes_sent: c.bytes_sent.load(std::sync::atomic::Ordering::Relaxed),
            bytes_received: c.bytes_received.load(std::sync::atomic::Ordering::Relaxed),
            reconnects: c.reconnects.load(std::sync::atomic::Ordering::Relaxed),
            discontinuities: c.discontinuities.load(std::sync::atomic::Ordering::Relaxed),
            local_connections: self.endpoint.accepted(),
            rejected_local_connections: self.endpoint.rejected(),
            created_at_unix_ms: self.created_at_unix_ms,
        }
    }

    async fn close(&self, reason: CloseReason) {
        if self.closed.set(reason.clone()).is_err() {
            return;
        }
        self.endpoint.stop();
        self.sessions.close().await;
        self.cancel.cancel();
        telemetry::tunnel_closed(reason_label(&reason));

        if reason.is_terminal() {
            tracing::warn!(target=%self.target, reason=%reason, "broker: tunnel closed");
        } else {
            tracing::info!(target=%self.target, reason=%reason, "broker: tunnel closed");
        }
        let _ = self.events.send(TunnelEvent::Closed {
            target: self.target.clone(),
            reason,
        });
    }
}

fn reason_label(r: &CloseReason) -> &'static str {
    match r {
        CloseReason::LocalClosed => "local",
        CloseReason::RemoteClosed { .. } => "remote",
        CloseReason::Cancelled => "cancelled",
        CloseReason::IdleTimeout => "idle",
        CloseReason::Failed(_) => "failed",
    }
}

/// A lease on a tunnel. Dropping it gives the lease back.
#[derive(Debug)]
pub struct TunnelHandle {
    tunnel: Arc<Tunnel>,
    broker: Weak<Inner>,
}

impl TunnelHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.tunnel.local_addr()
    }

    pub fn target(&self) -> &Target {
        &self.tunnel.target
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.release(&self.tunnel);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub target: String,
    pub local_endpoint: Option<String>,
    pub policy: &'static str,
    pub state: &'static str,
    pub leases: usize,
    pub session_id: Option<String>,
    pub ack: Option<AckState>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
    pub discontinuities: u64,
    pub local_connections: u64,
    pub rejected_local_connections: u64,
    pub created_at_unix_ms: u64,
}

impl TunnelSnapshot {
    fn pending(target: &Target, policy: &'static str) -> Self {
        Self {
            target: target.to_string(),
            local_endpoint: None,
            policy,
            state: "connecting",
            leases: 0,
            session_id: None,
            ack: None,
            bytes_sent: 0,
            bytes_received: 0,
            reconnects: 0,
            discontinuities: 0,
            local_connections: 0,
            rejected_local_connections: 0,
            created_at_unix_ms: 0,
        }
    }
}
