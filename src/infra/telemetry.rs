use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
#[error("telemetry initialization failed: {0}")]
pub struct TelemetryError(String);

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError(format!("failed to install tracing subscriber: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "riserva_cache_hit_total",
            Unit::Count,
            "Total number of cache read hits."
        );
        describe_counter!(
            "riserva_cache_miss_total",
            Unit::Count,
            "Total number of cache read misses."
        );
        describe_counter!(
            "riserva_cache_evict_total",
            Unit::Count,
            "Total number of evictions due to capacity."
        );
        describe_counter!(
            "riserva_cache_spill_total",
            Unit::Count,
            "Total number of entries handed to the persistence sink."
        );
        describe_gauge!(
            "riserva_cache_len",
            Unit::Count,
            "Current number of entries held in the cache."
        );
    });
}
