//! EventBus Logging
//!
//! Installs a global `tracing` subscriber configured from `EVENTBUS_*`
//! environment variables. The eventbus crates log through `tracing` macros;
//! this crate only decides where and how those events are written.
//!
//! # Usage
//!
//! ```rust,no_run
//! eventbus_log::init();
//! tracing::info!(event = "OrderCreated", "Subscribed");
//! ```
//!
//! # Environment Variables
//!
//! - `EVENTBUS_DEBUG=1` - Enable debug logging
//! - `EVENTBUS_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `EVENTBUS_LOG_FORMAT=pretty|compact|json` - Set output format
//! - `EVENTBUS_LOG_TIMESTAMPS=1|0` - Include timestamps
//! - `EVENTBUS_LOG_MODULE=1|0` - Include the event target (module path)
//!
//! `RUST_LOG`, when set, takes precedence over the level for filtering.

use std::env;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Minimum level of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl Level {
    /// Directive understood by [`EnvFilter`]
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl FromStr for Level {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            other => Err(LogError::InvalidLevel(other.to_string())),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_directive())
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

impl FromStr for Format {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            other => Err(LogError::InvalidFormat(other.to_string())),
        }
    }
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Unknown log level: {0}")]
    InvalidLevel(String),

    #[error("Unknown log format: {0}")]
    InvalidFormat(String),

    /// A global subscriber was already installed
    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include the event target
    pub module_path: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            timestamps: true,
            module_path: true,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create config from an arbitrary variable source.
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        let debug = flag("EVENTBUS_DEBUG").unwrap_or(false);
        let level = lookup("EVENTBUS_LOG_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug { Level::Debug } else { Level::Info });
        let format = lookup("EVENTBUS_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Format::Json);

        Self {
            debug,
            level,
            format,
            timestamps: flag("EVENTBUS_LOG_TIMESTAMPS").unwrap_or(true),
            module_path: flag("EVENTBUS_LOG_MODULE").unwrap_or(true),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Level actually applied; debug mode never filters below `debug`
    pub fn effective_level(&self) -> Level {
        if self.debug && self.level > Level::Debug {
            Level::Debug
        } else {
            self.level
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.effective_level().as_directive()))
    }
}

/// Install the global subscriber from the environment, ignoring a
/// subscriber that is already installed.
pub fn init() {
    let _ = try_init();
}

/// Install the global subscriber from the environment.
pub fn try_init() -> Result<(), LogError> {
    try_init_with(&LogConfig::from_env())
}

/// Install the global subscriber from an explicit configuration.
pub fn try_init_with(config: &LogConfig) -> Result<(), LogError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(config.module_path)
        .with_writer(std::io::stderr);

    let result = match (config.format, config.timestamps) {
        (Format::Pretty, true) => builder.pretty().try_init(),
        (Format::Pretty, false) => builder.pretty().without_time().try_init(),
        (Format::Compact, true) => builder.compact().try_init(),
        (Format::Compact, false) => builder.compact().without_time().try_init(),
        #[cfg(feature = "json")]
        (Format::Json, true) => builder.json().try_init(),
        #[cfg(feature = "json")]
        (Format::Json, false) => builder.json().without_time().try_init(),
        #[cfg(not(feature = "json"))]
        (Format::Json, _) => builder.compact().try_init(),
    };
    result.map_err(|e| LogError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("DEBUG".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert!(matches!("loud".parse::<Level>(), Err(LogError::InvalidLevel(_))));
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("pretty".parse::<Format>().unwrap(), Format::Pretty);
        assert_eq!("Json".parse::<Format>().unwrap(), Format::Json);
        assert!("xml".parse::<Format>().is_err());
    }

    #[test]
    fn test_defaults_without_variables() {
        assert_eq!(LogConfig::from_lookup(lookup(&[])), LogConfig::default());
    }

    #[test]
    fn test_debug_flag_lowers_level() {
        let config = LogConfig::from_lookup(lookup(&[("EVENTBUS_DEBUG", "true")]));
        assert!(config.debug);
        assert_eq!(config.level, Level::Debug);

        let config = LogConfig::from_lookup(lookup(&[
            ("EVENTBUS_DEBUG", "1"),
            ("EVENTBUS_LOG_LEVEL", "error"),
        ]));
        assert_eq!(config.effective_level(), Level::Debug);
    }

    #[test]
    fn test_reads_all_variables() {
        let config = LogConfig::from_lookup(lookup(&[
            ("EVENTBUS_LOG_LEVEL", "warn"),
            ("EVENTBUS_LOG_FORMAT", "compact"),
            ("EVENTBUS_LOG_TIMESTAMPS", "0"),
            ("EVENTBUS_LOG_MODULE", "false"),
        ]));
        assert_eq!(config.level, Level::Warn);
        assert_eq!(config.format, Format::Compact);
        assert!(!config.timestamps);
        assert!(!config.module_path);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = LogConfig::from_lookup(lookup(&[
            ("EVENTBUS_LOG_LEVEL", "loud"),
            ("EVENTBUS_LOG_FORMAT", "xml"),
        ]));
        assert_eq!(config.level, Level::Info);
        assert_eq!(config.format, Format::Json);
    }

    #[test]
    fn test_second_init_reports_error() {
        let config = LogConfig::default().with_format(Format::Compact);
        let _ = try_init_with(&config);
        assert!(matches!(try_init_with(&config), Err(LogError::Init(_))));
        init();
    }
}
