//! Tracing setup for the engine and its binary.

use std::sync::Arc;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log output settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `vodhub_core=debug`.
    pub level: String,
    /// `json` for machine-readable lines, anything else for human output.
    pub format: String,
    /// Append to this file instead of stderr.
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level; an unparseable level is a
/// startup error rather than a silent default.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    // A plain level name must actually be one; richer directive strings
    // (`crate=debug,hyper=warn`) are handed to the filter parser as-is.
    let configured = match config.level.parse::<tracing::Level>() {
        Ok(level) => EnvFilter::new(level.to_string()),
        Err(_) if config.level.contains('=') || config.level.contains(',') => {
            EnvFilter::try_new(&config.level)
                .map_err(|e| anyhow::anyhow!("invalid log filter {:?}: {e}", config.level))?
        }
        Err(e) => anyhow::bail!("invalid log level {:?}: {e}", config.level),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_level() {
        // The error path never installs a subscriber, so this is safe to
        // run alongside other tests.
        assert!(init_logging(&LoggingConfig {
            level: "shouting".to_string(),
            ..LoggingConfig::default()
        })
        .is_err());
    }
}
