#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cleanup;
pub mod file;
mod format;

mod ansi;
mod err_with_sources;

use anyhow::{Context, Result};
use tracing::subscriber::DefaultGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

pub use ansi::stdout_supports_ansi;
pub use err_with_sources::{ErrorWithSources, err_with_src};
pub use format::Format;
pub use tracing_subscriber::filter::ParseError;

/// Registers a global subscriber with `additional_layer` and, if requested, stdout logging.
///
/// Under the service control manager there is no console, so `stdout` should be `false` there.
pub fn setup_global_subscriber<L>(directives: &str, additional_layer: L, stdout: bool) -> Result<()>
where
    L: Layer<Registry> + Send + Sync,
{
    if stdout && let Err(error) = output_vt100::try_init() {
        tracing::debug!("Failed to init terminal colors: {error}");
    }

    let file_filter = parse_filter(directives).context("Failed to parse directives")?;
    let stdout_filter = parse_filter(directives).context("Failed to parse directives")?;

    let subscriber = Registry::default()
        .with(additional_layer.with_filter(file_filter))
        .with(stdout.then(|| {
            fmt::layer()
                .with_ansi(stdout_supports_ansi())
                .event_format(Format::new())
                .with_filter(stdout_filter)
        }));
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Sets up a stdout logger for the short-lived commands like `--install`.
pub fn setup_bootstrap() -> Result<DefaultGuard> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let filter = parse_filter(&directives).context("Failed to parse directives")?;
    let layer = fmt::layer()
        .with_ansi(stdout_supports_ansi())
        .event_format(Format::new().without_timestamp())
        .with_filter(filter);
    let subscriber = Registry::default().with(layer);

    Ok(tracing::dispatcher::set_default(&subscriber.into()))
}

/// Checks that `directives` would be accepted by [`setup_global_subscriber`].
pub fn validate_directives(directives: &str) -> Result<(), ParseError> {
    parse_filter(directives).map(|_| ())
}

fn parse_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// Prepended to every filter so that a plain `debug` stays readable.
    ///
    /// Restate one of these crates with a lower level to get its logs back, e.g. `mio=trace`.
    const IRRELEVANT_CRATES: &str = "mio=info,windows_service=info,tokio_util=info";

    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}
