//! Installation of the global `tracing` subscriber.

use tower::BoxError;
use tracing_subscriber::EnvFilter;

use crate::configuration::LoggingConfiguration;
use crate::configuration::LoggingFormat;

const DEFAULT_FILTER: &str = "info";

/// Installs a `fmt` subscriber as the global default.
///
/// The filter comes from the configuration, then from `RUST_LOG`, then defaults to `info`.
/// Returns `Ok(false)` if a global subscriber was already installed.
pub fn init(configuration: &LoggingConfiguration) -> Result<bool, BoxError> {
    let filter = env_filter(configuration)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match configuration.format {
        LoggingFormat::Text => builder.try_init(),
        LoggingFormat::Json => builder.json().try_init(),
    };
    match installed {
        Ok(()) => Ok(true),
        Err(err) => {
            tracing::debug!(error = %err, "a global subscriber is already installed");
            Ok(false)
        }
    }
}

fn env_filter(configuration: &LoggingConfiguration) -> Result<EnvFilter, BoxError> {
    Ok(match &configuration.filter {
        Some(filter) => EnvFilter::try_new(filter)?,
        None => {
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?
        }
    })
}
