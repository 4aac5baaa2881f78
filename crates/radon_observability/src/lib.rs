//! Observability setup: structured logging and Prometheus metrics.

use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Directive used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info,radon=debug";

/// Build the filter: `RUST_LOG` wins, then `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the global tracing subscriber with structured logging.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(default_directive: &str) {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Install the Prometheus exporter listening on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// One client statement finished.
pub fn record_query_metrics(elapsed: Duration, kind: &str, success: bool) {
    metrics::counter!("radon_queries_total", "type" => kind.to_string(), "success" => success.to_string())
        .increment(1);
    metrics::histogram!("radon_query_duration_us", "type" => kind.to_string()).record(elapsed.as_micros() as f64);
}

/// Client-visible transaction control (`begin`, `commit`, `rollback`, `kill`).
pub fn record_txn_metrics(action: &str) {
    metrics::counter!("radon_txn_total", "action" => action.to_string()).increment(1);
}

pub fn record_active_sessions(count: usize) {
    metrics::gauge!("radon_active_sessions").set(count as f64);
}

pub fn record_disk_usage(percent: f64, highwater: bool) {
    metrics::gauge!("radon_disk_used_percent").set(percent);
    metrics::gauge!("radon_disk_highwater").set(if highwater { 1.0 } else { 0.0 });
}

/// Sessions killed by the idle-transaction reaper.
pub fn record_reaped_session() {
    metrics::counter!("radon_idle_txn_reaped_total").increment(1);
}
