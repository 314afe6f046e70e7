//! Tracing subscriber setup.

use std::str::FromStr;
use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Env var holding the filter directive, e.g. `HEXMERGE_LOG=hexmerge_core=debug`.
pub const LOG_ENV: &str = "HEXMERGE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log collectors.
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}', expected json or pretty")),
        }
    }
}

/// Installs the global subscriber. Safe to call more than once; only the
/// first call has any effect.
pub fn init(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        // A subscriber installed by an embedding process wins.
        let _ = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_current_span(false).with_target(true))
                .try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        };
    });
}
