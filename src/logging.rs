//! Log output for the driver.
//!
//! Every component logs through `tracing` with structured fields (`serial`,
//! `tick`, `code`, `state`); this module only installs the subscriber that
//! writes those events to stderr. Stdout is left to the CLI's sample stream.
//!
//! `RUST_LOG`, when set, overrides the level from [`NodeOptions::log_level`].
//!
//! ```no_run
//! use forceplate_daq::{config::NodeOptions, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = NodeOptions::load()?;
//! logging::init_from_options(&options)?;
//! tracing::info!(serial = "PF001", "Platform opened");
//! # Ok(())
//! # }
//! ```

use crate::config::NodeOptions;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Line format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured. For a developer watching a session.
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}' (pretty, compact, json)", other)),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level written when `RUST_LOG` is unset.
    pub level: Level,
    /// Line format.
    pub format: OutputFormat,
    /// Also log span open/close, e.g. the per-session `session` span.
    pub with_span_events: bool,
    /// Source location on every event.
    pub with_file_and_line: bool,
    /// Terminal colours. Never applied to JSON.
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Settings for the level named in `options.log_level`.
    pub fn from_options(options: &NodeOptions) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&options.log_level)?))
    }

    /// Compact output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }

    fn stderr_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let span_events = if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .with_file(self.with_file_and_line)
            .with_line_number(self.with_file_and_line)
            .with_ansi(self.with_ansi && self.format != OutputFormat::Json);

        match self.format {
            OutputFormat::Pretty => layer.pretty().boxed(),
            OutputFormat::Compact => layer.compact().boxed(),
            OutputFormat::Json => layer.json().boxed(),
        }
    }
}

/// Install the subscriber for `options.log_level`.
pub fn init_from_options(options: &NodeOptions) -> Result<(), String> {
    init(LoggingConfig::from_options(options)?)
}

/// Install the global subscriber.
///
/// A no-op when one is already installed (a second call, a test harness,
/// or a host application with its own subscriber).
pub fn init(config: LoggingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let layer = config.stderr_layer::<Registry>().with_filter(config.filter());
    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Lost a race with another initialiser
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(format!("failed to install log subscriber: {}", e)),
    }
}

/// `"trace"` … `"error"`, case-insensitive.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.trim().parse::<Level>().map_err(|_| {
        format!(
            "invalid log level '{}' (trace, debug, info, warn, error)",
            level
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert_eq!(parse_log_level(" Error "), Ok(Level::ERROR));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn options_select_level() {
        let options = NodeOptions {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let config = LoggingConfig::from_options(&options).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Compact);
    }

    #[test]
    fn formats_parse() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("Pretty".parse::<OutputFormat>(), Ok(OutputFormat::Pretty));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn second_init_is_a_no_op() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
