//! Tracing and Sentry initialization.

use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{SentryConfig, StorefrontConfig};

const DEFAULT_FILTER: &str = "urban_threads_storefront=info,urban_threads_cli=info";

/// Keeps error reporting alive. Hold it for the life of the process.
#[must_use = "dropping the guard flushes and disables Sentry"]
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Initialize Sentry (when a DSN is configured) and the global tracing
/// subscriber.
///
/// Sentry is set up first so its tracing layer sees every event.
pub fn init(config: &StorefrontConfig) -> TelemetryGuard {
    let sentry = init_sentry(&config.sentry);

    // Defaults to info level for our crates if RUST_LOG is not set
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let sentry_layer = sentry_tracing::layer().event_filter(sentry_event_filter);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(sentry_layer);
    let result = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }

    if sentry.is_some() {
        tracing::info!("Sentry initialized");
    }
    TelemetryGuard { _sentry: sentry }
}

/// Initialize Sentry error tracking and return the guard that keeps it alive.
fn init_sentry(config: &SentryConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.dsn.as_ref()?;

    Some(sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config.environment.clone().map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    )))
}

/// Route tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        tracing::Level::TRACE => sentry_tracing::EventFilter::Ignore,
    }
}
