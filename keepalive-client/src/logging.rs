//! Tracing subscriber setup driven by environment variables.
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `KEEPALIVE_LOG_LEVEL` | `trace`, `debug`, `info`, `warn`, `error`, `off` | `info` |
//! | `KEEPALIVE_LOG_FORMAT` | `pretty`, `compact`, `json` | `compact` |
//! | `RUST_LOG` | any `EnvFilter` directive | overrides the level |

use std::env;
use std::io::IsTerminal;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Trace level (most verbose)
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
    /// No logging
    Off,
}

impl Level {
    /// Parse a level name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "off" | "none" => Some(Self::Off),
            _ => None,
        }
    }

    /// Directive understood by `EnvFilter`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line, human oriented
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl Format {
    /// Parse a format name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: Format,
    /// Emit ANSI colors.
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Compact,
            color: std::io::stderr().is_terminal(),
        }
    }
}

impl LogConfig {
    /// Read the configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let level = env::var("KEEPALIVE_LOG_LEVEL")
            .ok()
            .and_then(|s| Level::parse(&s))
            .unwrap_or(defaults.level);

        let format = env::var("KEEPALIVE_LOG_FORMAT")
            .ok()
            .and_then(|s| Format::parse(&s))
            .unwrap_or(defaults.format);

        Self {
            level,
            format,
            color: defaults.color,
        }
    }

    /// Set the level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the format.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }
}

/// Install a global subscriber for `config`.
///
/// Fails if a global subscriber is already set.
pub fn init(config: &LogConfig) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(config.filter());
    let writer = std::io::stderr;

    match config.format {
        Format::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(config.color).with_writer(writer))
            .try_init(),
        Format::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.color).with_writer(writer))
            .try_init(),
        Format::Json => registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
    }
}

/// Install a global subscriber configured from the environment.
pub fn init_from_env() -> Result<(), TryInitError> {
    init(&LogConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("none"), Some(Level::Off));
        assert_eq!(Level::parse("verbose"), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("json"), Some(Format::Json));
        assert_eq!(Format::parse(" Pretty "), Some(Format::Pretty));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::default()
            .with_level(Level::Trace)
            .with_format(Format::Json);
        assert_eq!(config.level, Level::Trace);
        assert_eq!(config.format, Format::Json);
    }
}
