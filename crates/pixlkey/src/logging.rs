//! Tracing subscriber setup.
//!
//! The level is read from `PIXLKEY_LOG` (`debug`, `info`, `warn`, `error`,
//! or any `EnvFilter` directive), defaulting to `info`. Records emitted
//! through the `log` facade (the database layer) are forwarded as well.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "PIXLKEY_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

pub fn init(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize tracing subscriber")?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize tracing subscriber")?,
    }

    tracing::debug!(log_format = ?format, "Logging initialized");
    Ok(())
}
