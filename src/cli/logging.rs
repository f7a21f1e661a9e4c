//! Diagnostic logging setup
//!
//! Filter precedence: `STACKCTL_LOG`, then `--verbose`, then the project's
//! `[logging] filter`, then `stackctl=warn`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::storage::LogFormat;

pub const FILTER_ENV: &str = "STACKCTL_LOG";

const DEFAULT_FILTER: &str = "stackctl=warn";
const VERBOSE_FILTER: &str = "stackctl=debug";

fn filter(verbose: bool, configured: Option<&str>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(FILTER_ENV) {
        return filter;
    }

    let directive = if verbose {
        VERBOSE_FILTER
    } else {
        configured.unwrap_or(DEFAULT_FILTER)
    };

    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber, writing to stderr
pub fn init(format: LogFormat, verbose: bool, configured: Option<&str>) {
    let registry = tracing_subscriber::registry().with(filter(verbose, configured));

    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };

    if let Err(e) = installed {
        eprintln!("warning: logging already initialized: {}", e);
    }
}
