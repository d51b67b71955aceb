//! Logging and metrics setup, plus the metric names used across the service.

use crate::config::LoggingConfig;
use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const FRAMES_PROCESSED: &str = "detector_frames_processed_total";
pub const FRAMES_SKIPPED: &str = "detector_frames_skipped_total";
pub const BAD_FRAMES: &str = "detector_bad_frames_total";
pub const FEED_FAILURES: &str = "detector_feed_failures_total";
pub const SYNC_BATCHES: &str = "detector_sync_batches_total";
pub const SKIP_FACTOR: &str = "detector_skip_factor";
pub const ACTIVE_LOTS: &str = "detector_active_lots";
pub const CYCLE_SECONDS: &str = "detector_cycle_seconds";

/// Initialize the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("parkwatch_detector={},tower_http=info", config.level)))
        .context("Invalid log level")?
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).try_init()?;
    } else {
        subscriber.with(fmt::layer().pretty()).try_init()?;
    }

    Ok(())
}

/// Install the Prometheus exporter. A port of 0 leaves metrics unexported.
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    if port == 0 {
        info!("Prometheus metrics exporter disabled");
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    describe_metrics();
    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(FRAMES_PROCESSED, "Frames classified across all lots");
    metrics::describe_counter!(FRAMES_SKIPPED, "Frames discarded by adaptive skipping");
    metrics::describe_counter!(BAD_FRAMES, "Frames that failed to decode");
    metrics::describe_counter!(FEED_FAILURES, "Failed frame acquisition attempts");
    metrics::describe_counter!(SYNC_BATCHES, "Backend sync deliveries by result");
    metrics::describe_gauge!(SKIP_FACTOR, "Current skip factor per lot");
    metrics::describe_gauge!(ACTIVE_LOTS, "Registered lots");
    metrics::describe_histogram!(CYCLE_SECONDS, "Processing cycle duration");
}
