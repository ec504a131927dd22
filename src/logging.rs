//! Diagnostic logging via `tracing` + `tracing-subscriber`.
//!
//! Logs go to stderr so they never interleave with the multiplexed command
//! output on stdout. Level priority:
//! 1. `--log-level`
//! 2. `PARRUN_LOG` environment variable
//! 3. `warn`

use anyhow::{anyhow, Result};
use tracing::Level;

pub const LOG_ENV: &str = "PARRUN_LOG";

/// Values accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Installs the global subscriber. Call once, from `main`.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let level = resolve_level(cli_level, std::env::var(LOG_ENV).ok().as_deref());
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install logger: {err}"))
}

/// An unparsable `PARRUN_LOG` is ignored; the subscriber is not up yet to report it.
fn resolve_level(cli_level: Option<LogLevel>, env_value: Option<&str>) -> Level {
    if let Some(level) = cli_level {
        return level.into();
    }
    env_value
        .and_then(|value| value.trim().parse::<Level>().ok())
        .unwrap_or(Level::WARN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_level_beats_environment() {
        assert_eq!(resolve_level(Some(LogLevel::Debug), Some("error")), Level::DEBUG);
    }

    #[test]
    fn environment_is_used_when_cli_is_silent() {
        assert_eq!(resolve_level(None, Some(" Info ")), Level::INFO);
        assert_eq!(resolve_level(None, Some("TRACE")), Level::TRACE);
    }

    #[test]
    fn falls_back_to_warn() {
        assert_eq!(resolve_level(None, None), Level::WARN);
        assert_eq!(resolve_level(None, Some("loud")), Level::WARN);
    }
}
