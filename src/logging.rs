//! Process-wide tracing subscriber.
//!
//! Servers, the broker hub and tests all log through `tracing`. This module
//! installs one `tracing-subscriber` registry per process with
//!
//! - a reloadable `EnvFilter`, seeded from `RUST_LOG` when set, otherwise
//!   from the configured level; `slotLoggerPriority` swaps it at runtime
//! - one of three line formats ([`LogFormat`])
//!
//! ```no_run
//! use karabo::logging::{self, LogFormat, LoggingConfig};
//! use tracing::Level;
//!
//! # fn main() -> karabo::KaraboResult<()> {
//! logging::init(&LoggingConfig::new(Level::DEBUG).format(LogFormat::Json))?;
//! tracing::info!(server_id = "S1", "server started");
//! logging::set_level("warn")?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

use crate::config::ServerConfig;
use crate::error::{KaraboError, KaraboResult};

/// Line format of the log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, coloured; for terminals.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(KaraboError::Config(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// What [`init`] installs.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set.
    pub level: Level,
    /// Line format.
    pub format: LogFormat,
    /// Colour codes in pretty output.
    pub ansi: bool,
    /// Source file and line of each event.
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LoggingConfig {
    /// Pretty output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: LogFormat::Pretty,
            ansi: true,
            source_location: false,
        }
    }

    /// `log_level` and `log_format` of a server configuration.
    pub fn from_server_config(config: &ServerConfig) -> KaraboResult<Self> {
        Ok(Self::new(parse_log_level(&config.log_level)?).format(config.log_format.parse()?))
    }

    /// Use `format` for every line.
    #[must_use]
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable colour codes.
    #[must_use]
    pub fn ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Include file and line of every event.
    #[must_use]
    pub fn source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }
}

static FILTER: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
}

/// Install the global subscriber.
///
/// A second call, or a call after someone else installed a subscriber, is a
/// no-op; [`set_level`] then only affects a subscriber installed here.
pub fn init(config: &LoggingConfig) -> KaraboResult<()> {
    if FILTER.get().is_some() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(config.level));
    let (filter, handle) = reload::Layer::new(filter);

    let lines = fmt::layer()
        .with_file(config.source_location)
        .with_line_number(config.source_location);
    let lines = match config.format {
        LogFormat::Pretty => lines.pretty().with_ansi(config.ansi).boxed(),
        LogFormat::Compact => lines.compact().with_ansi(false).boxed(),
        LogFormat::Json => lines.json().with_current_span(false).boxed(),
    };

    if tracing_subscriber::registry().with(filter).with(lines).try_init().is_ok() {
        let _ = FILTER.set(handle);
    } else {
        tracing::debug!("global subscriber already installed, keeping it");
    }
    Ok(())
}

/// Replace the active level, e.g. from `slotLoggerPriority`.
pub fn set_level(level: &str) -> KaraboResult<()> {
    let level = parse_log_level(level)?;
    let Some(handle) = FILTER.get() else {
        tracing::debug!(%level, "log level change ignored, subscriber not ours");
        return Ok(());
    };
    handle
        .reload(filter_for(level))
        .map_err(|e| KaraboError::Config(format!("cannot change log level: {e}")))
}

/// Level by name, case-insensitive. `WARNING` and `FATAL` are accepted as
/// aliases of warn and error.
pub fn parse_log_level(name: &str) -> KaraboResult<Level> {
    match name.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" | "WARNING" => Ok(Level::WARN),
        "ERROR" | "FATAL" => Ok(Level::ERROR),
        _ => Err(KaraboError::Config(format!(
            "Invalid log level '{name}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("Warning").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("FATAL").unwrap(), Level::ERROR);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn server_config_selects_level_and_format() {
        let server = ServerConfig {
            log_level: "debug".to_string(),
            log_format: "json".to_string(),
            ..ServerConfig::default()
        };
        let config = LoggingConfig::from_server_config(&server).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);

        let bad = ServerConfig {
            log_format: "xml".to_string(),
            ..ServerConfig::default()
        };
        assert!(LoggingConfig::from_server_config(&bad).is_err());
    }

    #[test]
    fn second_init_keeps_first_subscriber() {
        init(&LoggingConfig::default().ansi(false)).unwrap();
        init(&LoggingConfig::new(Level::TRACE).format(LogFormat::Compact)).unwrap();
        set_level("debug").unwrap();
        assert!(set_level("nope").is_err());
    }
}
