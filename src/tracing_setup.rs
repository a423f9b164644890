use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::LoggingConfig;

/// Initialize tracing with custom configuration.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level, json = json_format, spans = include_spans, "Trunkline logging initialized");
    Ok(())
}

/// Initialize tracing from the `[logging]` section of the configuration
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_tracing_with_config(&config.level, config.json, config.json)
}

/// Span covering the whole life of one proxy transaction
pub fn create_transaction_span(transaction_id: &str, method: &str, call_id: Option<&str>) -> tracing::Span {
    tracing::info_span!(
        "transaction",
        transaction.id = transaction_id,
        sip.method = method,
        sip.call_id = call_id.unwrap_or_default(),
        trunk = tracing::field::Empty,
        sip.status_code = tracing::field::Empty,
    )
}

/// Span covering one egress attempt towards a destination
pub fn create_attempt_span(trunk: &str, destination: &str, attempt: usize) -> tracing::Span {
    tracing::info_span!(
        "egress_attempt",
        trunk,
        destination,
        attempt,
        sip.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}
