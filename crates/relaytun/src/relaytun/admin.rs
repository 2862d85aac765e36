use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::relaytun::{telemetry, tunnel::broker::TunnelBroker};

#[derive(Clone)]
pub struct AdminState {
    pub broker: TunnelBroker,
    pub prometheus: Option<telemetry::SharedPrometheusHandle>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tunnels", get(tunnels))
        .route("/metrics", get(metrics))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(addr: SocketAddr, state: AdminState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %listener.local_addr()?, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    tunnels: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let tunnels = st.broker.snapshot().len();
    (StatusCode::OK, Json(HealthResponse { ok: true, tunnels }))
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.broker.snapshot()))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.prometheus {
        Some(h) => (StatusCode::OK, h.render()),
        None => (StatusCode::NOT_FOUND, "metrics: recorder not installed\n".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::relaytun::tunnel::{
        broker::BrokerOptions,
        credential::StaticToken,
        policy::{AddressOnly, AnyLocalProcess},
        target::Target,
        testing::{MockRelay, RelayPlan, fast_options},
    };

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        s.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        s.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_health_and_tunnels() {
        let relay = MockRelay::new(RelayPlan::default());
        let broker = TunnelBroker::with_resolver(
            relay.dialer(),
            Arc::new(StaticToken::new("t")),
            Arc::new(AddressOnly),
            BrokerOptions {
                client: fast_options(),
                ..BrokerOptions::default()
            },
        );
        let _h = broker
            .connect(
                Target::new("proj-1", "zone-1", "vm-1", 3389),
                Arc::new(AnyLocalProcess),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let app = router(AdminState {
            broker: broker.clone(),
            prometheus: None,
        });
        tokio::spawn(async move {
            let _ = axum::serve(ln, app).await;
        });

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.contains("\"tunnels\":1"), "{health}");

        let tunnels = get(addr, "/tunnels").await;
        assert!(tunnels.contains("projects/proj-1/zones/zone-1/instances/vm-1:3389"), "{tunnels}");
        assert!(tunnels.contains("\"session_id\":\"S1\""), "{tunnels}");

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 404"), "{metrics}");
    }
}
