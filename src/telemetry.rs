use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{PipelineError, Result};

/// Builds the level filter. `RUST_LOG` wins over the configured level.
pub fn env_filter(cfg: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&cfg.level)
        .map_err(|err| PipelineError::Config(format!("invalid log level `{}`: {err}", cfg.level)))
}

/// Installs the global subscriber. Binaries call this once at startup; the
/// library never does.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = env_filter(cfg)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if cfg.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    installed.map_err(|err| PipelineError::Config(format!("tracing already initialised: {err}")))
}
