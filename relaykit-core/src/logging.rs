use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Keeps transport crates quiet unless `RUST_LOG` says otherwise
const DEPENDENCY_DIRECTIVES: &[&str] = &["hyper=warn", "redis=warn", "tower_http=info"];

/// Initialize structured logging based on configuration
///
/// `json` format for production, anything else renders pretty output.
/// `RUST_LOG` overrides the configured level entirely.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let writer = make_writer(config.file_path.as_deref())?;
    let registry = tracing_subscriber::registry().with(build_filter(level));

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_writer(writer);
        registry.with(json_layer).try_init()?;
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer);
        registry.with(pretty_layer).try_init()?;
    }

    Ok(())
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(DEPENDENCY_DIRECTIVES.join(","))
}

/// Stdout, or the configured file opened for append
fn make_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    let Some(path) = file_path else {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {path}"))?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("WARNING").unwrap(), Level::WARN);
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_init_logging_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_make_writer_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaykit.log");

        assert!(make_writer(path.to_str()).is_ok());
        assert!(path.exists());
        assert!(make_writer(Some("/nonexistent-dir/relaykit.log")).is_err());
    }
}
