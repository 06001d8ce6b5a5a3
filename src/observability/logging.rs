//! Structured logging through `tracing`
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE, defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact, defaults to json
//! - `LOG_SPANS`: include span open/close events (true/false)
//! - `RUST_LOG`: replaces the computed filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./analysis-consumer run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependency targets capped at WARN unless `RUST_LOG` says otherwise
pub const NOISY_TARGETS: &[&str] = &["lapin", "amq_protocol", "hyper", "reqwest", "warp", "tokio"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Machine-readable, one JSON object per line
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self {
            level: parse_level(&env::var("LOG_LEVEL").unwrap_or_default()),
            format: LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default()),
            include_spans: env::var("LOG_SPANS")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// `-v` raises the level to at least DEBUG, `-vv` to TRACE
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        let floor = match verbose {
            0 => return self,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        // tracing orders levels by verbosity: TRACE > DEBUG > INFO
        if floor > self.level {
            self.level = floor;
        }
        self
    }
}

/// Filter for `level` with noisy dependencies capped, unless `rust_log` overrides
pub fn build_filter(level: Level, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return EnvFilter::new(directives);
    }

    NOISY_TARGETS
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Install the global subscriber; later calls are ignored
pub fn init_logging(settings: LogSettings) {
    let rust_log = env::var("RUST_LOG").ok();
    let filter = build_filter(settings.level, rust_log.as_deref());
    let span_events = if settings.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);
    let installed = match settings.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(span_events))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    init_logging(LogSettings::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_unknown_defaults_to_json() {
        for input in ["", "xml", "yaml", "invalid"] {
            assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input}");
        }
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("loud", Level::INFO),
            ("", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_verbosity_raises_level() {
        let base = LogSettings::default();
        assert_eq!(base.with_verbosity(0).level, Level::INFO);
        assert_eq!(base.with_verbosity(1).level, Level::DEBUG);
        assert_eq!(base.with_verbosity(2).level, Level::TRACE);
        assert_eq!(base.with_verbosity(7).level, Level::TRACE);
    }

    #[test]
    fn test_verbosity_never_lowers_level() {
        let trace = LogSettings {
            level: Level::TRACE,
            ..Default::default()
        };
        assert_eq!(trace.with_verbosity(1).level, Level::TRACE);
    }

    #[test]
    fn test_filter_caps_noisy_targets() {
        let rendered = build_filter(Level::DEBUG, None).to_string();
        assert!(rendered.contains("debug"));
        for target in NOISY_TARGETS {
            assert!(rendered.contains(&format!("{target}=warn")), "{target} missing");
        }
    }

    #[test]
    fn test_rust_log_overrides_filter() {
        let rendered = build_filter(Level::INFO, Some("lapin=trace")).to_string();
        assert_eq!(rendered, "lapin=trace");

        let blank = build_filter(Level::INFO, Some("  ")).to_string();
        assert!(blank.contains("lapin=warn"));
    }
}
