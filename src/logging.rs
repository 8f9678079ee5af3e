//! Tracing subscriber installation.

use thiserror::Error;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

const CRATE_DEBUG_DIRECTIVE: &str = "genpage=debug";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log directive `{directive}`: {source}")]
    Directive {
        directive: &'static str,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Builds the filter for `logging`: `RUST_LOG` directives on top of the
/// configured level, plus `genpage=debug` when debugging is switched on.
pub fn filter(logging: &LoggingSettings) -> Result<EnvFilter, LoggingError> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    if logging.debug {
        let directive =
            CRATE_DEBUG_DIRECTIVE
                .parse()
                .map_err(|source| LoggingError::Directive {
                    directive: CRATE_DEBUG_DIRECTIVE,
                    source,
                })?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), LoggingError> {
    let env_filter = filter(logging)?;

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
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
