use std::{
    str::FromStr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::relaytun::tunnel::{
    client::{ClientStatus, RelayTunnelClient, SessionContext, TunnelState},
    error::{CloseReason, TunnelError},
};

/// What happens to the relay session when a local connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LegClose {
    /// Close it; the next local connection gets a fresh session (RDP, SSH).
    #[default]
    CloseSession,
    /// Keep it; the next local connection continues the same stream (serial console).
    KeepSession,
}

impl FromStr for LegClose {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "close" | "close_session" => Ok(LegClose::CloseSession),
            "keep" | "keep_session" => Ok(LegClose::KeepSession),
            other => anyhow::bail!("tunnel: unknown leg_close {other:?} (expected close|keep)"),
        }
    }
}

/// Owns the relay client currently backing a tunnel.
pub struct RelaySessions {
    ctx: SessionContext,
    leg_close: LegClose,
    current: StdMutex<Option<Arc<RelayTunnelClient>>>,
    // Serializes session creation; never held by readers of `current`.
    opening: Mutex<()>,
    cancel: CancellationToken,
    fatal: CancellationToken,
    terminal: Arc<StdMutex<Option<CloseReason>>>,
}

impl std::fmt::Debug for RelaySessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySessions")
            .field("target", &self.ctx.target)
            .field("leg_close", &self.leg_close)
            .finish_non_exhaustive()
    }
}

impl RelaySessions {
    /// `first` is the session opened while the tunnel was being created. `cancel` is the
    /// tunnel's token; every later session is opened under it.
    pub fn new(
        ctx: SessionContext,
        leg_close: LegClose,
        first: RelayTunnelClient,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let s = Arc::new(Self {
            ctx,
            leg_close,
            current: StdMutex::new(None),
            opening: Mutex::new(()),
            cancel,
            fatal: CancellationToken::new(),
            terminal: Arc::new(StdMutex::new(None)),
        });
        s.install(Arc::new(first));
        s
    }

    pub fn leg_close(&self) -> LegClose {
        self.leg_close
    }

    /// The session for the next local connection, opening a fresh one if the last has closed.
    pub async fn acquire(&self) -> Result<Arc<RelayTunnelClient>, TunnelError> {
        let _opening = self.opening.lock().await;
        if let Some(c) = self.live() {
            return Ok(c);
        }
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        tracing::debug!(target=%self.ctx.target, "session: opening relay session");
        match RelayTunnelClient::connect(self.ctx.clone(), &self.cancel).await {
            Ok(c) => {
                let c = Arc::new(c);
                self.install(c.clone());
                Ok(c)
            }
            Err(TunnelError::Cancelled) => Err(TunnelError::Cancelled),
            Err(err) => {
                self.fail(CloseReason::failed(err.clone()));
                Err(err)
            }
        }
    }

    /// A local connection using `client` has ended.
    pub async fn release(&self, client: &Arc<RelayTunnelClient>) {
        if self.leg_close == LegClose::KeepSession {
            return;
        }
        let taken = {
            let mut cur = self.lock_current();
            match cur.as_ref() {
                Some(c) if Arc::ptr_eq(c, client) => cur.take(),
                _ => None,
            }
        };
        if let Some(c) = taken {
            self.close_client(&c).await;
        }
    }

    /// Status of the current session, if there is one.
    pub fn status(&self) -> Option<ClientStatus> {
        self.lock_current().as_ref().map(|c| c.status())
    }

    /// Fires when a session failed in a way that ends the whole tunnel.
    pub fn fatal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub fn terminal_reason(&self) -> Option<CloseReason> {
        lock(&self.terminal).clone()
    }

    /// Gracefully closes the current session.
    pub async fn close(&self) {
        let taken = self.lock_current().take();
        if let Some(c) = taken {
            self.close_client(&c).await;
        }
    }

    fn live(&self) -> Option<Arc<RelayTunnelClient>> {
        let mut cur = self.lock_current();
        match cur.as_ref() {
            Some(c) if !c.state().is_closed() => Some(c.clone()),
            Some(_) => {
                cur.take();
                None
            }
            None => None,
        }
    }

    fn install(&self, client: Arc<RelayTunnelClient>) {
        self.watch_terminal(client.watch_status());
        *self.lock_current() = Some(client);
    }

    fn watch_terminal(&self, mut status: watch::Receiver<ClientStatus>) {
        let fatal = self.fatal.clone();
        let terminal = self.terminal.clone();
        tokio::spawn(async move {
            let state = match status.wait_for(|s| s.state.is_closed()).await {
                Ok(s) => s.state.clone(),
                Err(_) => return,
            };
            if let TunnelState::Closed(reason) = state {
                if reason.is_terminal() {
                    lock(&terminal).get_or_insert(reason);
                    fatal.cancel();
                }
            }
        });
    }

    fn fail(&self, reason: CloseReason) {
        lock(&self.terminal).get_or_insert(reason);
        self.fatal.cancel();
    }

    async fn close_client(&self, c: &RelayTunnelClient) {
        // A relay that stops reading must not stall teardown forever.
        let limit = self.ctx.options.handshake_timeout.max(Duration::from_secs(1));
        if tokio::time::timeout(limit, c.close()).await.is_err() {
            tracing::warn!(
                target=%self.ctx.target,
                "session: close did not finish within {}; abandoning",
                humantime::format_duration(limit)
            );
        }
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Arc<RelayTunnelClient>>> {
        lock(&self.current)
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
