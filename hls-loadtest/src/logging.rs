use tracing::Level;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{fmt, prelude::*};

use crate::config::Config;

/// Initialize the global tracing subscriber from the run's verbosity flags.
/// `--log-filter` takes precedence over `--verbose`/`--quiet`, which in turn
/// take precedence over `RUST_LOG`.
pub fn init(config: &Config) {
    let filter = if let Some(directive) = &config.log_filter {
        EnvFilter::new(directive.clone())
    } else if config.quiet {
        EnvFilter::new("error")
    } else if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(config.verbose))
        .init();
}
