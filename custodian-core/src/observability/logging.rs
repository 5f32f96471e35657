use crate::config::LogFormat;
use crate::error::CoreError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level`. Calling this twice returns
/// an error rather than panicking, so embedding hosts that already installed
/// a subscriber can ignore it.
pub fn init_tracing(service_name: &str, log_level: &str, format: LogFormat) -> Result<(), CoreError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
            .try_init(),
    };

    result.map_err(|e| CoreError::Logging(e.to_string()))?;

    tracing::info!(service = %service_name, "Tracing initialized");
    Ok(())
}
