// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber initialization.

use std::io;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Line layout of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One line per event, span fields inline.
    Compact,
    /// Multi-field layout with span context.
    Full,
}

/// How the bus's `tracing` output is filtered and printed.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level for `meshbus` targets when `RUST_LOG` is unset.
    pub level: Level,
    /// Level for everything else (notify, tokio). Dependencies are noisy at
    /// debug, so this stays at WARN unless asked.
    pub dependency_level: Level,
    /// Log span enter/close, useful for following one message through the router.
    pub span_events: bool,
    pub file_line: bool,
    pub target: bool,
    pub ansi: bool,
    pub format: LogFormat,
    /// Explicit directive; overrides both levels and `RUST_LOG`.
    pub directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            dependency_level: Level::WARN,
            span_events: false,
            file_line: false,
            target: true,
            ansi: true,
            format: LogFormat::Compact,
            directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Debug output with span timings and source locations.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            span_events: true,
            file_line: true,
            format: LogFormat::Full,
            ..Self::default()
        }
    }

    /// Warnings only, no colour; for a bus run under a supervisor.
    pub fn production() -> Self {
        Self {
            level: Level::WARN,
            target: false,
            ansi: false,
            ..Self::default()
        }
    }

    /// Everything from this crate, nothing from dependencies.
    pub fn testing() -> Self {
        Self {
            level: Level::TRACE,
            span_events: true,
            file_line: true,
            ansi: false,
            format: LogFormat::Full,
            ..Self::default()
        }
    }

    /// Map the CLI's `--verbose`/`--debug` flags onto a preset.
    pub fn for_cli(verbose: bool, debug: bool) -> Self {
        match (verbose, debug) {
            (_, true) => Self::development(),
            (true, false) => Self::default(),
            (false, false) => Self::default().with_level(Level::WARN),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Directive used when neither `directive` nor `RUST_LOG` is set.
    pub fn default_directive(&self) -> String {
        format!(
            "{},meshbus={}",
            self.dependency_level.as_str().to_ascii_lowercase(),
            self.level.as_str().to_ascii_lowercase()
        )
    }

    fn filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_directive());
        match &self.directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Returned by [`init_telemetry`]; hold it for the life of the program.
#[must_use]
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber. Output goes to stderr so command output
/// on stdout stays machine-readable.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi)
        .with_target(config.target)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(config.filter());
    let installed = match config.format {
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
        LogFormat::Full => registry.with(layer).try_init(),
    };
    installed.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let default = TelemetryConfig::default();
        assert_eq!(default.level, Level::INFO);
        assert_eq!(default.format, LogFormat::Compact);

        let dev = TelemetryConfig::development();
        assert_eq!(dev.level, Level::DEBUG);
        assert!(dev.span_events);
        assert_eq!(dev.dependency_level, Level::WARN);

        let prod = TelemetryConfig::production();
        assert_eq!(prod.level, Level::WARN);
        assert!(!prod.ansi);
    }

    #[test]
    fn test_cli_flags() {
        assert_eq!(TelemetryConfig::for_cli(false, false).level, Level::WARN);
        assert_eq!(TelemetryConfig::for_cli(true, false).level, Level::INFO);
        assert_eq!(TelemetryConfig::for_cli(true, true).level, Level::DEBUG);
        assert_eq!(TelemetryConfig::for_cli(false, true).level, Level::DEBUG);
    }

    #[test]
    fn test_default_directive_scopes_crate_level() {
        assert_eq!(TelemetryConfig::default().default_directive(), "warn,meshbus=info");
        assert_eq!(
            TelemetryConfig::testing().default_directive(),
            "warn,meshbus=trace"
        );
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::default()
            .with_level(Level::DEBUG)
            .with_directive("meshbus::router=trace")
            .with_ansi(false);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.directive.as_deref(), Some("meshbus::router=trace"));
        assert!(!config.ansi);
    }
}
