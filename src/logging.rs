//! Structured logging setup (SPEC_FULL.md §8), adapted from the teacher's
//! `aion-core::logging` module and trimmed to what this batch engine needs:
//! no `CorrelationId`/`RequestId` (those exist for HTTP request tracing) and
//! no sampler, since every run already bounds its own log volume by account
//! and discovery-unit count.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub with_target: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            format: LogFormat::default(),
            with_target: false,
        }
    }
}

/// Installs the global `tracing` subscriber. Call once at process startup;
/// safe to call from tests guarded by `try_init` to tolerate re-entry.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = fmt().with_env_filter(filter).with_target(config.with_target);

    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    // `try_init` fails if a subscriber is already installed; that's
    // expected under repeated test init and not a real error.
    let _ = result;
    Ok(())
}
