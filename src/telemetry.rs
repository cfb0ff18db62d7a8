use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{prelude::*, Registry};

pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    // Explicitly set default info if RUST_LOG is empty
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    Registry::default().with(env_filter).with(fmt_layer).init();
}

/// Installs the global Prometheus recorder and its scrape endpoint.
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .idle_timeout(metrics_util::MetricKindMask::ALL, Some(Duration::from_secs(60)))
        .install()
        .context("failed to install Prometheus recorder")?;
    Ok(())
}
