//! Logging utilities and configuration for the metric engine.
//!
//! Resolution runs on hot paths, so detail logging is gated behind
//! [`LogConfig`] flags and the macros below only format their arguments when
//! the corresponding flag is on.

use tracing::Level;

/// Logging configuration for an engine instance.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level for engine components
    pub base_level: Level,
    /// Whether to log each provider invocation during resolution
    pub log_resolution_details: bool,
    /// Whether to log executed round trips (combined queries and jobs)
    pub log_round_trips: bool,
    /// Maximum length for logged field values (domain keys, SQL text)
    pub max_field_length: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_level: Level::INFO,
            log_resolution_details: false,
            log_round_trips: true,
            max_field_length: 256,
        }
    }
}

impl LogConfig {
    /// Creates a verbose configuration suitable for debugging.
    pub fn verbose() -> Self {
        Self {
            base_level: Level::DEBUG,
            log_resolution_details: true,
            log_round_trips: true,
            max_field_length: 1024,
        }
    }

    /// Creates a minimal configuration for production with lowest overhead.
    pub fn production() -> Self {
        Self {
            base_level: Level::WARN,
            log_resolution_details: false,
            log_round_trips: false,
            max_field_length: 128,
        }
    }
}

/// Macro for performance-sensitive debug logging.
///
/// Only evaluates its arguments if debug logging is enabled in the config.
#[macro_export]
macro_rules! perf_debug {
    ($config:expr, $($arg:tt)*) => {
        if $config.base_level >= tracing::Level::DEBUG {
            tracing::debug!($($arg)*);
        }
    };
}

/// Macro for conditional per-metric resolution logging.
#[macro_export]
macro_rules! log_resolution {
    ($config:expr, $($arg:tt)*) => {
        if $config.log_resolution_details {
            tracing::debug!($($arg)*);
        }
    };
}

/// Macro for conditional round-trip logging.
#[macro_export]
macro_rules! log_round_trip {
    ($config:expr, $($arg:tt)*) => {
        if $config.log_round_trips {
            tracing::info!($($arg)*);
        }
    };
}

/// Truncates a string to the maximum field length if needed.
pub fn truncate_field(value: &str, max_length: usize) -> String {
    if value.len() <= max_length {
        return value.to_string();
    }
    let mut cut = max_length;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...(truncated)", &value[..cut])
}

/// Global subscriber installation for binaries and tests embedding the engine.
pub mod setup {
    use tracing::Level;

    /// Output format of the installed subscriber.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        /// Multi-line human readable output
        Pretty,
        /// Single-line output
        Compact,
        /// One JSON object per event
        Json,
    }

    /// Subscriber settings: a default level, an override for `term_metrics`
    /// targets, and an output format.
    #[derive(Debug, Clone)]
    pub struct SubscriberConfig {
        pub default_level: Level,
        pub engine_level: Level,
        pub format: LogFormat,
        /// Replaces the computed directive string when set
        pub directives: Option<String>,
    }

    impl Default for SubscriberConfig {
        fn default() -> Self {
            Self {
                default_level: Level::INFO,
                engine_level: Level::DEBUG,
                format: LogFormat::Compact,
                directives: None,
            }
        }
    }

    impl SubscriberConfig {
        /// JSON output, engine events at INFO and everything else at WARN.
        pub fn production() -> Self {
            Self {
                default_level: Level::WARN,
                engine_level: Level::INFO,
                format: LogFormat::Json,
                directives: None,
            }
        }

        /// Pretty output with engine internals at TRACE.
        pub fn debugging() -> Self {
            Self {
                default_level: Level::DEBUG,
                engine_level: Level::TRACE,
                format: LogFormat::Pretty,
                directives: None,
            }
        }

        pub fn with_format(mut self, format: LogFormat) -> Self {
            self.format = format;
            self
        }

        pub fn with_engine_level(mut self, level: Level) -> Self {
            self.engine_level = level;
            self
        }

        pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
            self.directives = Some(directives.into());
            self
        }

        /// `EnvFilter` directive string, e.g. `warn,term_metrics=info`.
        pub fn directives(&self) -> String {
            match &self.directives {
                Some(directives) => directives.clone(),
                None => format!(
                    "{},term_metrics={}",
                    self.default_level.as_str().to_lowercase(),
                    self.engine_level.as_str().to_lowercase()
                ),
            }
        }
    }

    /// Installs the global subscriber. `RUST_LOG` takes precedence over the
    /// configured directives.
    ///
    /// ```rust,no_run
    /// use term_metrics::logging::setup::{init_logging, LogFormat, SubscriberConfig};
    ///
    /// init_logging(SubscriberConfig::default().with_format(LogFormat::Json)).unwrap();
    /// ```
    pub fn init_logging(config: SubscriberConfig) -> Result<(), Box<dyn std::error::Error>> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.directives()));

        let layer = match config.format {
            LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
            LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?;
        Ok(())
    }
}
