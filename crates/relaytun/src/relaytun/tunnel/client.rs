//! Reconnecting relay client.
//!
//! A `RelayTunnelClient` exposes one logical duplex byte stream to one target. A driver task
//! owns the relay connection and the send buffer; link faults are repaired by resuming the
//! relay session and replaying unacknowledged bytes, so callers never see them.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use rand::{RngExt, rng};
use serde::Serialize;
use tokio::{
    sync::{Mutex, broadcast, mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::relaytun::tunnel::{
    buffer::SequencedSendBuffer,
    connection::{RelayConnection, RelayEvent, ResumePoint},
    credential::CredentialSource,
    error::{CloseReason, TunnelError},
    protocol::{CloseCode, CloseDisposition, MAX_DATA_PAYLOAD},
    target::Target,
    transport::RelayDialer,
};

const COMMAND_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub handshake_timeout: Duration,
    pub connect_attempts: u32,
    pub reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Zero disables keepalive.
    pub keepalive_interval: Duration,
    pub send_high_water: usize,
    /// Received bytes after which an ack is forced even without outbound traffic.
    pub ack_threshold: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            send_high_water: 4 << 20,
            ack_threshold: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Connected,
    Faulted,
    Reconnecting { attempt: u32 },
    Closed(CloseReason),
}

impl TunnelState {
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelState::Closed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Faulted => "faulted",
            TunnelState::Reconnecting { .. } => "reconnecting",
            TunnelState::Closed(_) => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AckState {
    pub bytes_sent_total: u64,
    pub bytes_acked_by_peer: u64,
    pub bytes_received: u64,
    pub last_ack_sent: u64,
}

#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub state: TunnelState,
    pub session_id: String,
    pub ack: AckState,
}

/// Per-tunnel counters, shared by every session the tunnel opens.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub discontinuities: AtomicU64,
}

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Created {
        target: Target,
        local_endpoint: SocketAddr,
    },
    Reconnecting {
        target: Target,
        attempt: u32,
        cause: String,
    },
    Reconnected {
        target: Target,
        session_id: String,
        ack_offset: u64,
    },
    Discontinuity {
        target: Target,
        session_id: String,
    },
    SessionClosed {
        target: Target,
        reason: CloseReason,
    },
    Closed {
        target: Target,
        reason: CloseReason,
    },
}

/// Everything needed to open relay sessions for one target.
#[derive(Clone)]
pub struct SessionContext {
    pub target: Target,
    pub dialer: Arc<dyn RelayDialer>,
    pub credentials: Arc<dyn CredentialSource>,
    pub options: ClientOptions,
    pub counters: Arc<TrafficCounters>,
    pub events: broadcast::Sender<TunnelEvent>,
}

impl SessionContext {
    fn emit(&self, ev: TunnelEvent) {
        let _ = self.events.send(ev);
    }
}

enum Inbound {
    Data(Bytes),
    /// The relay stream restarted; carries the new stream epoch.
    Discontinuity(u64),
}

/// Caller data tagged with the stream epoch it was written for.
struct Outbound {
    epoch: u64,
    data: Bytes,
}

pub struct RelayTunnelClient {
    target: Target,
    commands: mpsc::Sender<Outbound>,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    status: watch::Receiver<ClientStatus>,
    local_close: CancellationToken,
    // Current stream epoch, bumped by the driver on every restart.
    epoch: Arc<AtomicU64>,
    // Last epoch whose discontinuity the reader has seen.
    seen_epoch: AtomicU64,
}

impl std::fmt::Debug for RelayTunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.status.borrow();
        f.debug_struct("RelayTunnelClient")
            .field("target", &self.target)
            .field("state", &st.state)
            .field("session_id", &st.session_id)
            .finish_non_exhaustive()
    }
}

impl RelayTunnelClient {
    /// Opens a fresh relay session (with bounded retries) and starts the driver.
    ///
    /// Cancelling `cancel` aborts the handshake, and later closes the session.
    pub async fn connect(
        ctx: SessionContext,
        cancel: &CancellationToken,
    ) -> Result<Self, TunnelError> {
        let conn = open_session(&ctx, cancel).await?;
        Ok(Self::spawn(ctx, conn, cancel.child_token()))
    }

    fn spawn(ctx: SessionContext, conn: RelayConnection, cancel: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let (status_tx, status_rx) = watch::channel(ClientStatus {
            state: TunnelState::Connected,
            session_id: conn.session_id().to_string(),
            ack: AckState::default(),
        });
        let local_close = CancellationToken::new();
        let epoch = Arc::new(AtomicU64::new(0));

        let driver = Driver {
            buffer: SequencedSendBuffer::new(ctx.options.send_high_water),
            session_id: conn.session_id().to_string(),
            received: 0,
            last_ack_sent: 0,
            commands: cmd_rx,
            inbound: in_tx,
            status: status_tx,
            cancel,
            local_close: local_close.clone(),
            last_activity: Instant::now(),
            epoch: 0,
            shared_epoch: epoch.clone(),
            ctx: ctx.clone(),
        };
        tokio::spawn(driver.run(conn));

        Self {
            target: ctx.target,
            commands: cmd_tx,
            inbound: Mutex::new(in_rx),
            status: status_rx,
            local_close,
            epoch,
            seen_epoch: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> TunnelState {
        self.status.borrow().state.clone()
    }

    pub fn session_id(&self) -> String {
        self.status.borrow().session_id.clone()
    }

    pub fn ack_state(&self) -> AckState {
        self.status.borrow().ack
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Queues bytes for the relay. Waits while the send buffer is above its high-water mark.
    ///
    /// After the relay session was replaced, fails with [`TunnelError::Discontinuity`]
    /// until `recv` has reported the break.
    pub async fn send(&self, mut data: Bytes) -> Result<(), TunnelError> {
        if self.local_close.is_cancelled() {
            return Err(self.closed_error());
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        if epoch != self.seen_epoch.load(Ordering::Acquire) {
            return Err(TunnelError::Discontinuity);
        }
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_DATA_PAYLOAD));
            if self.commands.send(Outbound { epoch, data: chunk }).await.is_err() {
                return Err(self.closed_error());
            }
        }
        Ok(())
    }

    /// Next bytes from the far end. `Ok(None)` is a clean end of stream.
    pub async fn recv(&self) -> Result<Option<Bytes>, TunnelError> {
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(Inbound::Data(b)) => Ok(Some(b)),
            Some(Inbound::Discontinuity(epoch)) => {
                self.seen_epoch.store(epoch, Ordering::Release);
                Err(TunnelError::Discontinuity)
            }
            None => match self.state() {
                TunnelState::Closed(r) if !r.is_graceful() => Err(TunnelError::Closed(r)),
                _ => Ok(None),
            },
        }
    }

    /// Flushes queued data, then closes the relay session.
    pub async fn close(&self) -> CloseReason {
        self.local_close.cancel();
        self.closed().await
    }

    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.status.clone();
        let res = rx
            .wait_for(|s| s.state.is_closed())
            .await
            .map(|s| s.state.clone());
        let state = match res {
            Ok(s) => s,
            Err(_) => rx.borrow().state.clone(),
        };
        match state {
            TunnelState::Closed(r) => r,
            _ => CloseReason::Cancelled,
        }
    }

    fn closed_error(&self) -> TunnelError {
        match self.state() {
            TunnelState::Closed(r) => TunnelError::Closed(r),
            _ => TunnelError::Closed(CloseReason::LocalClosed),
        }
    }
}

impl Drop for RelayTunnelClient {
    fn drop(&mut self) {
        self.local_close.cancel();
    }
}

/// Fresh handshake with bounded, jittered exponential backoff.
async fn open_session(
    ctx: &SessionContext,
    cancel: &CancellationToken,
) -> Result<RelayConnection, TunnelError> {
    let opts = &ctx.options;
    let attempts = opts.connect_attempts.max(1);
    let mut backoff = opts.initial_backoff;
    let mut refreshed = false;
    let mut last = None;
    let mut attempt = 0;

    while attempt < attempts {
        attempt += 1;
        let token = ctx.credentials.bearer_token().await?;
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            r = RelayConnection::connect(&*ctx.dialer, &ctx.target, token, opts.handshake_timeout) => r,
        };

        match res {
            Ok(conn) => {
                metrics::counter!("relaytun_handshakes_total", "kind" => "connect").increment(1);
                tracing::info!(
                    target=%ctx.target,
                    session=%conn.session_id(),
                    attempt,
                    "tunnel: connected"
                );
                return Ok(conn);
            }
            Err(TunnelError::AuthorizationDenied(msg)) => {
                if !refreshed && ctx.credentials.on_authorization_denied().await {
                    refreshed = true;
                    attempt -= 1;
                    tracing::warn!(target=%ctx.target, err=%msg, "tunnel: authorization denied; retrying with refreshed token");
                    continue;
                }
                return Err(TunnelError::AuthorizationDenied(msg));
            }
            Err(err) if err.is_retryable() => {
                if attempt < attempts {
                    tracing::warn!(
                        target=%ctx.target,
                        attempt,
                        err=%err,
                        backoff=%humantime::format_duration(backoff),
                        "tunnel: connect failed; retrying"
                    );
                    sleep_or_cancel(jittered(backoff), cancel).await?;
                    backoff = (backoff * 2).min(opts.max_backoff);
                }
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(TunnelError::RetriesExhausted {
        attempts,
        last: Box::new(
            last.unwrap_or_else(|| TunnelError::NetworkUnreachable("no attempt made".into())),
        ),
    })
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> Result<(), TunnelError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        _ = tokio::time::sleep(d) => Ok(()),
    }
}

fn jittered(d: Duration) -> Duration {
    let ms = d.as_millis() as u64;
    if ms < 4 {
        return d;
    }
    d + Duration::from_millis(rng().random_range(0..=ms / 4))
}

enum Exit {
    Closed(CloseReason),
    Fault(TunnelError),
}

struct Driver {
    ctx: SessionContext,
    buffer: SequencedSendBuffer,
    session_id: String,
    received: u64,
    last_ack_sent: u64,
    commands: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<Inbound>,
    status: watch::Sender<ClientStatus>,
    cancel: CancellationToken,
    local_close: CancellationToken,
    last_activity: Instant,
    epoch: u64,
    shared_epoch: Arc<AtomicU64>,
}

impl Driver {
    async fn run(mut self, conn: RelayConnection) {
        let mut conn = conn;
        let reason = loop {
            match self.pump(&mut conn).await {
                Exit::Closed(reason) => {
                    conn.close().await;
                    break reason;
                }
                Exit::Fault(err) => {
                    drop(conn);
                    match self.recover(err).await {
                        Ok(next) => conn = next,
                        Err(reason) => break reason,
                    }
                }
            }
        };
        self.finish(reason);
    }

    async fn pump(&mut self, conn: &mut RelayConnection) -> Exit {
        let period = self.ctx.options.keepalive_interval;
        let tick = if period.is_zero() {
            Duration::from_secs(3600)
        } else {
            period
        };
        let mut keepalive = tokio::time::interval_at(Instant::now() + tick, tick);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Closed(CloseReason::Cancelled),
                _ = self.local_close.cancelled() => {
                    while let Ok(out) = self.commands.try_recv() {
                        if out.epoch != self.epoch {
                            continue;
                        }
                        if let Err(err) = self.send_data(conn, out.data).await {
                            return Exit::Fault(err);
                        }
                    }
                    return Exit::Closed(CloseReason::LocalClosed);
                }
                ev = conn.next_event() => match ev {
                    Ok(RelayEvent::Data(b)) => {
                        if let Err(exit) = self.deliver(conn, b).await {
                            return exit;
                        }
                    }
                    Ok(RelayEvent::Ack(n)) => {
                        if let Err(err) = self.on_ack(n) {
                            return Exit::Fault(err);
                        }
                    }
                    Ok(RelayEvent::Closed { code, reason }) => return self.on_relay_close(code, reason),
                    Err(err) => return Exit::Fault(err),
                },
                out = self.commands.recv(), if !self.buffer.is_full() => match out {
                    // Written for a stream that no longer exists.
                    Some(out) if out.epoch != self.epoch => {}
                    Some(out) => {
                        if let Err(err) = self.send_data(conn, out.data).await {
                            return Exit::Fault(err);
                        }
                    }
                    None => return Exit::Closed(CloseReason::LocalClosed),
                },
                _ = keepalive.tick(), if !period.is_zero() => {
                    if let Err(err) = self.keepalive(conn, period).await {
                        return Exit::Fault(err);
                    }
                }
            }
        }
    }

    async fn send_data(&mut self, conn: &mut RelayConnection, data: Bytes) -> Result<(), TunnelError> {
        let n = data.len() as u64;
        self.buffer.append(data.clone());
        self.ctx.counters.bytes_sent.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("relaytun_bytes_sent_total").increment(n);
        if self.received > self.last_ack_sent {
            self.send_ack(conn).await?;
        }
        conn.send_data(data).await?;
        self.last_activity = Instant::now();
        self.publish();
        Ok(())
    }

    async fn deliver(&mut self, conn: &mut RelayConnection, data: Bytes) -> Result<(), Exit> {
        let n = data.len() as u64;
        self.received += n;
        self.last_activity = Instant::now();
        self.ctx.counters.bytes_received.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("relaytun_bytes_received_total").increment(n);

        tokio::select! {
            _ = self.inbound.send(Inbound::Data(data)) => {}
            _ = self.cancel.cancelled() => return Err(Exit::Closed(CloseReason::Cancelled)),
            // Nobody is reading; the pump loop picks up the close next.
            _ = self.local_close.cancelled() => {}
        }

        if self.received - self.last_ack_sent >= self.ctx.options.ack_threshold {
            self.send_ack(conn).await.map_err(Exit::Fault)?;
        }
        self.publish();
        Ok(())
    }

    fn on_ack(&mut self, ack: u64) -> Result<(), TunnelError> {
        if ack == 0 {
            return Err(TunnelError::ProtocolViolation("relay acked zero bytes".into()));
        }
        self.buffer
            .on_ack(ack)
            .map_err(|err| TunnelError::ProtocolViolation(err.to_string()))?;
        self.publish();
        Ok(())
    }

    async fn send_ack(&mut self, conn: &mut RelayConnection) -> Result<(), TunnelError> {
        conn.send_ack(self.received).await?;
        self.last_ack_sent = self.received;
        Ok(())
    }

    async fn keepalive(&mut self, conn: &mut RelayConnection, period: Duration) -> Result<(), TunnelError> {
        if self.received > self.last_ack_sent {
            self.send_ack(conn).await?;
            self.publish();
            return Ok(());
        }
        if self.last_activity.elapsed() >= period {
            tracing::trace!(target=%self.ctx.target, "tunnel: keepalive ping");
            conn.ping().await?;
        }
        Ok(())
    }

    fn on_relay_close(&self, code: CloseCode, reason: String) -> Exit {
        match code.disposition() {
            CloseDisposition::Graceful | CloseDisposition::BackendUnreachable => {
                Exit::Closed(CloseReason::RemoteClosed { code, reason })
            }
            CloseDisposition::Denied => Exit::Closed(CloseReason::failed(
                TunnelError::AuthorizationDenied(format!("relay closed session: {code}")),
            )),
            CloseDisposition::NotFound => Exit::Closed(CloseReason::failed(
                TunnelError::TargetNotFound(format!("relay closed session: {code}")),
            )),
            CloseDisposition::SessionLost | CloseDisposition::Transient => Exit::Fault(
                TunnelError::NetworkUnreachable(format!("relay closed session: {code}")),
            ),
        }
    }

    async fn recover(&mut self, cause: TunnelError) -> Result<RelayConnection, CloseReason> {
        tracing::warn!(
            target=%self.ctx.target,
            session=%self.session_id,
            err=%cause,
            unacked=self.buffer.unacked(),
            "tunnel: relay link faulted"
        );
        self.set_state(TunnelState::Faulted);

        let opts = self.ctx.options.clone();
        let attempts = opts.reconnect_attempts.max(1);
        let mut backoff = opts.initial_backoff;
        let mut refreshed = false;
        let mut last = cause;
        let mut attempt = 0;

        while attempt < attempts {
            attempt += 1;
            self.set_state(TunnelState::Reconnecting { attempt });
            self.ctx.emit(TunnelEvent::Reconnecting {
                target: self.ctx.target.clone(),
                attempt,
                cause: last.to_string(),
            });
            if attempt > 1 {
                tracing::warn!(
                    target=%self.ctx.target,
                    attempt,
                    err=%last,
                    backoff=%humantime::format_duration(backoff),
                    "tunnel: reconnect failed; retrying"
                );
                if sleep_or_cancel(jittered(backoff), &self.cancel).await.is_err() {
                    return Err(CloseReason::Cancelled);
                }
                backoff = (backoff * 2).min(opts.max_backoff);
            }

            let token = self
                .ctx
                .credentials
                .bearer_token()
                .await
                .map_err(CloseReason::failed)?;
            let at = ResumePoint {
                session_id: self.session_id.clone(),
                acked: self.buffer.acked(),
                sent_total: self.buffer.sent_total(),
                received: self.received,
            };
            let res = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CloseReason::Cancelled),
                r = RelayConnection::resume(&*self.ctx.dialer, &self.ctx.target, token, &at, opts.handshake_timeout) => r,
            };

            match res {
                Ok((conn, ack)) => match self.replay(conn, ack).await {
                    Ok(conn) => {
                        self.ctx.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("relaytun_reconnects_total").increment(1);
                        tracing::info!(
                            target=%self.ctx.target,
                            session=%self.session_id,
                            ack,
                            attempt,
                            "tunnel: reconnected"
                        );
                        self.ctx.emit(TunnelEvent::Reconnected {
                            target: self.ctx.target.clone(),
                            session_id: self.session_id.clone(),
                            ack_offset: ack,
                        });
                        self.set_state(TunnelState::Connected);
                        return Ok(conn);
                    }
                    Err(err) => last = err,
                },
                Err(TunnelError::SessionExpired) => return self.restart().await,
                Err(TunnelError::AuthorizationDenied(msg)) => {
                    if !refreshed && self.ctx.credentials.on_authorization_denied().await {
                        refreshed = true;
                        last = TunnelError::AuthorizationDenied(msg);
                        continue;
                    }
                    return Err(CloseReason::failed(TunnelError::AuthorizationDenied(msg)));
                }
                Err(err) if err.is_retryable() => last = err,
                Err(err) => return Err(CloseReason::failed(err)),
            }
        }

        Err(CloseReason::failed(TunnelError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }))
    }

    async fn replay(&mut self, mut conn: RelayConnection, ack: u64) -> Result<RelayConnection, TunnelError> {
        let chunks = self
            .buffer
            .replay_from(ack)
            .map_err(|err| TunnelError::ProtocolViolation(err.to_string()))?;
        let mut replayed = 0usize;
        for chunk in chunks {
            replayed += chunk.len();
            conn.send_data(chunk).await?;
        }
        // The resume request already told the relay how much we received.
        self.last_ack_sent = self.received;
        self.last_activity = Instant::now();
        self.publish();
        tracing::debug!(target=%self.ctx.target, ack, replayed, "tunnel: replayed unacknowledged data");
        Ok(conn)
    }

    /// The relay forgot the session: start a new one and tell the reader the stream broke.
    async fn restart(&mut self) -> Result<RelayConnection, CloseReason> {
        tracing::warn!(
            target=%self.ctx.target,
            session=%self.session_id,
            "tunnel: relay session expired; starting a new session"
        );
        let conn = match open_session(&self.ctx, &self.cancel).await {
            Ok(conn) => conn,
            Err(TunnelError::Cancelled) => return Err(CloseReason::Cancelled),
            Err(err) => return Err(CloseReason::failed(err)),
        };

        self.epoch += 1;
        self.shared_epoch.store(self.epoch, Ordering::Release);
        let mut lost = self.buffer.unacked();
        while let Ok(out) = self.commands.try_recv() {
            lost += out.data.len() as u64;
        }
        self.buffer = SequencedSendBuffer::new(self.ctx.options.send_high_water);
        self.received = 0;
        self.last_ack_sent = 0;
        self.session_id = conn.session_id().to_string();
        self.last_activity = Instant::now();
        self.ctx.counters.discontinuities.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relaytun_discontinuities_total").increment(1);
        tracing::warn!(
            target=%self.ctx.target,
            session=%self.session_id,
            lost_bytes=lost,
            "tunnel: stream discontinuity"
        );
        self.ctx.emit(TunnelEvent::Discontinuity {
            target: self.ctx.target.clone(),
            session_id: self.session_id.clone(),
        });

        let sid = self.session_id.clone();
        self.status.send_modify(|s| {
            s.session_id = sid;
            s.state = TunnelState::Connected;
        });
        self.publish();

        tokio::select! {
            _ = self.inbound.send(Inbound::Discontinuity(self.epoch)) => {}
            _ = self.cancel.cancelled() => return Err(CloseReason::Cancelled),
            _ = self.local_close.cancelled() => {}
        }
        Ok(conn)
    }

    fn set_state(&self, state: TunnelState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn publish(&self) {
        let ack = AckState {
            bytes_sent_total: self.buffer.sent_total(),
            bytes_acked_by_peer: self.buffer.acked(),
            bytes_received: self.received,
            last_ack_sent: self.last_ack_sent,
        };
        self.status.send_if_modified(|s| {
            if s.ack == ack {
                return false;
            }
            s.ack = ack;
            true
        });
    }

    fn finish(self, reason: CloseReason) {
        if reason.is_terminal() {
            tracing::warn!(target=%self.ctx.target, session=%self.session_id, reason=%reason, "tunnel: session failed");
        } else {
            tracing::info!(target=%self.ctx.target, session=%self.session_id, reason=%reason, "tunnel: session closed");
        }
        self.ctx.emit(TunnelEvent::SessionClosed {
            target: self.ctx.target.clone(),
            reason: reason.clone(),
        });
        self.status.send_modify(|s| s.state = TunnelState::Closed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relaytun::tunnel::credential::StaticToken;
    use crate::relaytun::tunnel::testing::{MockRelay, RelayPlan, eventually, fast_options};

    fn ctx(relay: &MockRelay) -> SessionContext {
        ctx_with(relay, Arc::new(StaticToken::new("token-1")))
    }

    fn ctx_with(relay: &MockRelay, credentials: Arc<dyn CredentialSource>) -> SessionContext {
        let (events, _) = broadcast::channel(64);
        SessionContext {
            target: Target::new("proj-1", "zone-1", "vm-1", 3389),
            dialer: relay.dialer(),
            credentials,
            options: fast_options(),
            counters: Arc::new(TrafficCounters::default()),
            events,
        }
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    async fn read_exact(client: &RelayTunnelClient, n: usize) -> Vec<u8> {
        let mut got = Vec::with_capacity(n);
        while got.len() < n {
            let b = tokio::time::timeout(Duration::from_secs(5), client.recv())
                .await
                .expect("recv timed out")
                .unwrap()
                .expect("unexpected end of stream");
            got.extend_from_slice(&b);
        }
        got
    }

    #[tokio::test]
    async fn drop_after_partial_ack_resumes_and_replays_tail() {
        let relay = MockRelay::new(RelayPlan {
            drop_at: vec![400],
            ..RelayPlan::default()
        });
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();
        assert_eq!(client.session_id(), "S1");

        let data = pattern(1000);
        client.send(Bytes::from(data.clone())).await.unwrap();

        eventually("far end holds 1000 bytes", || relay.received("S1").len() >= 1000).await;
        assert_eq!(relay.received("S1"), data);
        assert_eq!(relay.resumes(), vec![("S1".to_string(), 400, 0)]);
        assert_eq!(relay.handshakes(), 1);

        eventually("ack catches up", || client.ack_state().bytes_acked_by_peer == 1000).await;
        assert_eq!(client.state(), TunnelState::Connected);
    }

    #[tokio::test]
    async fn repeated_drops_lose_and_duplicate_nothing() {
        let relay = MockRelay::new(RelayPlan {
            drop_at: vec![1000, 20_000, 50_001],
            echo: true,
            ..RelayPlan::default()
        });
        let cancel = CancellationToken::new();
        let client = Arc::new(RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap());

        let mut status = client.watch_status();
        let sampler = tokio::spawn(async move {
            let mut prev = AckState::default();
            while status.changed().await.is_ok() {
                let ack = status.borrow_and_update().ack;
                assert!(ack.bytes_acked_by_peer <= ack.bytes_sent_total);
                assert!(ack.bytes_acked_by_peer >= prev.bytes_acked_by_peer);
                assert!(ack.bytes_sent_total >= prev.bytes_sent_total);
                assert!(ack.bytes_received >= prev.bytes_received);
                prev = ack;
                if ack.bytes_acked_by_peer == 64 * 1024 && ack.bytes_received == 64 * 1024 {
                    break;
                }
            }
        });

        let data = pattern(64 * 1024);
        let writer = {
            let client = client.clone();
            let data = data.clone();
            tokio::spawn(async move {
                for chunk in data.chunks(3000) {
                    client.send(Bytes::copy_from_slice(chunk)).await.unwrap();
                }
            })
        };

        let echoed = read_exact(&client, data.len()).await;
        writer.await.unwrap();
        assert_eq!(echoed, data);

        eventually("far end holds all bytes", || relay.received("S1").len() >= data.len()).await;
        assert_eq!(relay.received("S1"), data);
        assert_eq!(relay.resumes().len(), 3);
        assert_eq!(relay.handshakes(), 1);

        tokio::time::timeout(Duration::from_secs(5), sampler)
            .await
            .expect("ack sampler finished")
            .unwrap();
    }

    #[tokio::test]
    async fn resume_reports_bytes_received() {
        let relay = MockRelay::new(RelayPlan::default());
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();

        relay.push("S1", b"0123456789");
        assert_eq!(read_exact(&client, 10).await, b"0123456789");

        relay.cut("S1");
        eventually("resumed", || !relay.resumes().is_empty()).await;
        assert_eq!(relay.resumes()[0], ("S1".to_string(), 0, 10));

        eventually("link reopened", || relay.has_open_link("S1")).await;
        relay.push("S1", b"abc");
        assert_eq!(read_exact(&client, 3).await, b"abc");
    }

    #[tokio::test]
    async fn bounded_connect_retries() {
        let relay = MockRelay::new(RelayPlan {
            unreachable_dials: 10,
            ..RelayPlan::default()
        });
        let cancel = CancellationToken::new();
        let err = RelayTunnelClient::connect(ctx(&relay), &cancel)
            .await
            .unwrap_err();
        match err {
            TunnelError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, TunnelError::NetworkUnreachable(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(relay.dials(), 3);
    }

    #[tokio::test]
    async fn authorization_denied_is_not_retried() {
        let relay = MockRelay::new(RelayPlan {
            deny_connects: 1,
            ..RelayPlan::default()
        });
        let cancel = CancellationToken::new();
        let err = RelayTunnelClient::connect(ctx(&relay), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::AuthorizationDenied(_)), "{err:?}");
        assert_eq!(relay.handshakes(), 1);
    }

    struct Rotating {
        n: AtomicU64,
    }

    #[async_trait::async_trait]
    impl CredentialSource for Rotating {
        async fn bearer_token(&self) -> Result<String, TunnelError> {
            Ok(format!("token-{}", self.n.load(Ordering::SeqCst)))
        }

        async fn on_authorization_denied(&self) -> bool {
            self.n.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn refreshed_credentials_get_exactly_one_retry() {
        let relay = MockRelay::new(RelayPlan {
            deny_connects: 1,
            ..RelayPlan::default()
        });
        let creds = Arc::new(Rotating { n: AtomicU64::new(0) });
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx_with(&relay, creds.clone()), &cancel)
            .await
            .unwrap();
        assert_eq!(client.session_id(), "S1");
        assert_eq!(relay.tokens(), vec!["token-0".to_string(), "token-1".to_string()]);

        relay.update(|p| p.deny_connects = 5);
        let err = RelayTunnelClient::connect(ctx_with(&relay, creds), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::AuthorizationDenied(_)));
        assert_eq!(relay.handshakes(), 4);
    }

    #[tokio::test]
    async fn expired_session_restarts_with_discontinuity() {
        let relay = MockRelay::new(RelayPlan {
            expire_sessions: true,
            ..RelayPlan::default()
        });
        let cancel = CancellationToken::new();
        let c = ctx(&relay);
        let mut events = c.events.subscribe();
        let client = RelayTunnelClient::connect(c, &cancel).await.unwrap();

        client.send(Bytes::from_static(b"before")).await.unwrap();
        eventually("first bytes", || relay.received("S1").len() == 6).await;
        relay.cut("S1");

        let err = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, TunnelError::Discontinuity);
        assert_eq!(client.session_id(), "S2");
        assert_eq!(client.ack_state(), AckState::default());

        client.send(Bytes::from_static(b"after")).await.unwrap();
        eventually("bytes on new session", || relay.received("S2") == b"after").await;

        let mut saw = false;
        while let Ok(ev) = events.try_recv() {
            if let TunnelEvent::Discontinuity { session_id, .. } = ev {
                assert_eq!(session_id, "S2");
                saw = true;
            }
        }
        assert!(saw);
    }

    #[tokio::test]
    async fn send_after_expiry_fails_until_reader_sees_break() {
        let relay = MockRelay::new(RelayPlan {
            expire_sessions: true,
            ..RelayPlan::default()
        });
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();

        client.send(Bytes::from_static(b"before")).await.unwrap();
        eventually("first bytes", || relay.received("S1").len() == 6).await;
        relay.cut("S1");
        eventually("new session", || client.session_id() == "S2").await;

        let err = client
            .send(Bytes::from_static(b"old-stream-tail"))
            .await
            .unwrap_err();
        assert_eq!(err, TunnelError::Discontinuity);

        let err = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, TunnelError::Discontinuity);

        client.send(Bytes::from_static(b"fresh")).await.unwrap();
        eventually("bytes on new session", || relay.received("S2") == b"fresh").await;
    }

    #[tokio::test]
    async fn reconnect_attempts_are_bounded() {
        let relay = MockRelay::new(RelayPlan::default());
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();

        relay.update(|p| p.unreachable_dials = 100);
        relay.cut("S1");

        let reason = tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        match reason {
            CloseReason::Failed(err) => match *err {
                TunnelError::RetriesExhausted { attempts, last } => {
                    assert_eq!(attempts, 4);
                    assert!(matches!(*last, TunnelError::NetworkUnreachable(_)), "{last:?}");
                }
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
        // One initial dial plus one per reconnect attempt.
        assert_eq!(relay.dials(), 5);
    }

    #[tokio::test]
    async fn graceful_relay_close_ends_stream() {
        let relay = MockRelay::new(RelayPlan::default());
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();

        relay.close_session("S1", CloseCode::DESTINATION_READ_FAILED, "backend closed");
        let got = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert!(matches!(
            client.closed().await,
            CloseReason::RemoteClosed { code: CloseCode::DESTINATION_READ_FAILED, .. }
        ));
        assert!(matches!(
            client.send(Bytes::from_static(b"x")).await,
            Err(TunnelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn revoked_authorization_is_terminal() {
        let relay = MockRelay::new(RelayPlan::default());
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();

        relay.close_session("S1", CloseCode::NOT_AUTHORIZED, "revoked");
        let reason = tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert!(reason.is_terminal());
        assert!(matches!(
            client.recv().await,
            Err(TunnelError::Closed(CloseReason::Failed(_)))
        ));
        assert!(relay.resumes().is_empty());
    }

    #[tokio::test]
    async fn close_flushes_queued_data() {
        let relay = MockRelay::new(RelayPlan::default());
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();

        let data = pattern(40_000);
        client.send(Bytes::from(data.clone())).await.unwrap();
        assert_eq!(client.close().await, CloseReason::LocalClosed);
        eventually("flushed", || relay.received("S1").len() == data.len()).await;
        assert_eq!(relay.received("S1"), data);
        assert!(client.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn cancellation_closes_session() {
        let relay = MockRelay::new(RelayPlan::default());
        let cancel = CancellationToken::new();
        let client = RelayTunnelClient::connect(ctx(&relay), &cancel).await.unwrap();
        cancel.cancel();
        assert_eq!(client.closed().await, CloseReason::Cancelled);
        assert!(matches!(
            client.recv().await,
            Err(TunnelError::Closed(CloseReason::Cancelled))
        ));
    }

    #[tokio::test]
    async fn idle_session_sends_keepalive_pings() {
        let relay = MockRelay::new(RelayPlan::default());
        let mut c = ctx(&relay);
        c.options.keepalive_interval = Duration::from_millis(20);
        let cancel = CancellationToken::new();
        let _client = RelayTunnelClient::connect(c, &cancel).await.unwrap();
        eventually("keepalive ping", || relay.pings() >= 2).await;
    }
}
