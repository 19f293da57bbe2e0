use color_eyre::eyre::{Result, eyre};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Logs go to stderr so stdout stays clean for reports.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            builder
                .with_ansi(false)
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .finish(),
        ),
        _ => tracing::subscriber::set_global_default(builder.finish()),
    };
    installed.map_err(|e| eyre!("failed to set tracing subscriber: {e}"))
}
