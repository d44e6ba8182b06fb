use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directives:?}: {source}")]
    Filter {
        directives: String,
        source: ParseError,
    },
    #[error("cannot install log subscriber: {0}")]
    Install(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_level`.
///
/// Records emitted through the `log` facade are bridged into the subscriber.
pub fn init(default_level: &str) -> Result<(), LoggingError> {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(from_env.as_deref(), default_level)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(LoggingError::Install)
}

fn build_filter(from_env: Option<&str>, default_level: &str) -> Result<EnvFilter, LoggingError> {
    if let Some(directives) = from_env {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return Ok(filter),
            Err(e) => log::warn!("Ignoring {}={:?}: {}", EnvFilter::DEFAULT_ENV, directives, e),
        }
    }
    EnvFilter::try_new(default_level).map_err(|source| LoggingError::Filter {
        directives: default_level.to_owned(),
        source,
    })
}
