use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::relaytun::{
    admin,
    config::{self, TunnelEntry},
    logging, net, telemetry,
    tunnel::{
        broker::{TunnelBroker, TunnelHandle},
        client::TunnelEvent,
        credential, transport,
    },
};

#[derive(Debug, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    /// A tunnel given on the command line, opened in addition to the configured ones.
    pub extra_tunnel: Option<TunnelEntry>,
    /// Print endpoints as JSON lines instead of text.
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct EndpointLine<'a> {
    target: String,
    local_endpoint: SocketAddr,
    policy: &'a str,
}

pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(opts.config_path)?;
    let cfg = config::load(&resolved)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let mut tunnels = cfg.tunnels.clone();
    tunnels.extend(opts.extra_tunnel);
    if tunnels.is_empty() {
        anyhow::bail!(
            "config: nothing to run (add [[tunnels]] or pass --project/--zone/--instance/--port)"
        );
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        relay = %cfg.relay.endpoint,
        transport = %cfg.relay.transport,
        tunnels = tunnels.len(),
        admin_addr = %cfg.admin_addr,
        "relaytun: starting"
    );

    let dialer = transport::dialer_by_name(&cfg.relay.transport, &cfg.relay.endpoint)?;
    let credentials = credential::from_config(&cfg.auth)?;
    let admin_enabled = !cfg.admin_addr.is_empty();
    let prom = if admin_enabled {
        Some(Arc::new(telemetry::init_prometheus()?))
    } else {
        None
    };

    let broker = TunnelBroker::new(dialer, credentials, cfg.broker_options());
    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    tasks.spawn(log_events(broker.clone(), shutdown.clone()));

    let connects = tunnels.iter().map(|t| {
        broker.connect(
            t.target.clone(),
            t.policy.build(),
            cfg.tunnel.connect_timeout,
        )
    });
    let results = futures_util::future::join_all(connects).await;

    let mut handles: Vec<TunnelHandle> = Vec::with_capacity(results.len());
    let mut failed = None;
    for (entry, res) in tunnels.iter().zip(results) {
        match res {
            Ok(h) => {
                print_endpoint(&h, opts.json)?;
                handles.push(h);
            }
            Err(err) => {
                tracing::error!(target = %entry.target, err = %err, "tunnel: connect failed");
                if failed.is_none() {
                    failed = Some(anyhow::Error::new(err).context(format!("connect {}", entry.target)));
                }
            }
        }
    }
    if let Some(err) = failed {
        broker.shutdown().await;
        return Err(err);
    }

    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            broker: broker.clone(),
            prometheus: prom,
        };
        tasks.spawn(admin::serve(addr, state, shutdown.clone()));
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM), the last tunnel closing, or a failed task.
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        _ = all_closed(&broker) => {
            Err(anyhow::anyhow!("relaytun: every tunnel has closed"))
        }
        Some(res) = tasks.join_next() => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(join_err.into()),
        },
    };

    shutdown.cancel();
    broker.shutdown().await;
    drop(handles);
    while tasks.join_next().await.is_some() {}
    tracing::info!("shutdown: done");
    outcome
}

fn print_endpoint(h: &TunnelHandle, json: bool) -> anyhow::Result<()> {
    let line = EndpointLine {
        target: h.target().to_string(),
        local_endpoint: h.local_addr(),
        policy: h.tunnel().policy_name(),
    };
    if json {
        println!("{}", serde_json::to_string(&line).context("encode endpoint")?);
    } else {
        println!("{} -> {} (policy {})", line.target, line.local_endpoint, line.policy);
    }
    Ok(())
}

async fn all_closed(broker: &TunnelBroker) {
    let mut events = broker.subscribe();
    loop {
        match events.recv().await {
            Ok(TunnelEvent::Closed { .. }) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                if broker.snapshot().is_empty() {
                    return;
                }
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn log_events(broker: TunnelBroker, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut events = broker.subscribe();
    loop {
        let ev = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            ev = events.recv() => ev,
        };
        match ev {
            Ok(TunnelEvent::Created { target, local_endpoint }) => {
                tracing::info!(target = %target, local = %local_endpoint, "event: tunnel created");
            }
            Ok(TunnelEvent::Reconnecting { target, attempt, cause }) => {
                tracing::warn!(target = %target, attempt, cause = %cause, "event: reconnecting");
            }
            Ok(TunnelEvent::Reconnected { target, session_id, ack_offset }) => {
                tracing::info!(target = %target, session = %session_id, ack_offset, "event: reconnected");
            }
            Ok(TunnelEvent::Discontinuity { target, session_id }) => {
                tracing::warn!(target = %target, session = %session_id, "event: stream restarted on a new relay session");
            }
            Ok(TunnelEvent::SessionClosed { target, reason }) => {
                tracing::debug!(target = %target, reason = %reason, "event: session closed");
            }
            Ok(TunnelEvent::Closed { target, reason }) => {
                tracing::info!(target = %target, reason = %reason, "event: tunnel closed");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event: log fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
