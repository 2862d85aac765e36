use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn tunnel_opened() {
    metrics::gauge!("relaytun_active_tunnels").increment(1.0);
    metrics::counter!("relaytun_tunnels_created_total").increment(1);
}

pub fn tunnel_closed(reason: &'static str) {
    metrics::gauge!("relaytun_active_tunnels").decrement(1.0);
    metrics::counter!("relaytun_tunnels_closed_total", "reason" => reason).increment(1);
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
