use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter directives are read from this variable.
pub const LOG_ENV: &str = "FERROFETCH_LOG";

const DEFAULT_DIRECTIVE: &str = "warn";

/// Installs a stderr subscriber filtered by `FERROFETCH_LOG` (default `warn`).
///
/// Safe to call more than once; later calls leave the existing subscriber in place.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_filter(filter),
    );

    if subscriber.try_init().is_err() {
        tracing::debug!("global tracing subscriber already initialized");
    }
}
