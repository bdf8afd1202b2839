//! Tracing setup for the host binary

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log line format on stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Directives used when `RUST_LOG` is unset
///
/// rmcp is kept quieter than the host; server stderr lines are logged under
/// `mcp_host::server_stderr` at debug level.
pub fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "mcp_host=debug,rmcp=info"
    } else {
        "mcp_host=info,rmcp=warn"
    }
}

/// Route logs to stderr; stdout carries command output
///
/// A non-empty `RUST_LOG` replaces the default directives.
pub fn init_tracing(verbose: bool, format: LogFormat) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(default_directives(verbose))?,
    };

    let output = match format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(verbose)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()?;
    Ok(())
}
