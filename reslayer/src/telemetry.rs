//! Tracing subscriber setup.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use reslayer_core::{
    error::{ResourceError, ResourceResult},
    settings::LoggingSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-readable output
    Pretty,
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(ResourceError::Configuration(format!("unknown log format {other:?}"))),
        }
    }
}

/// Installs the global subscriber described by `settings`.
///
/// `RUST_LOG`, when set, takes precedence over the configured filter. Fails if a
/// global subscriber is already installed.
pub fn init(settings: &LoggingSettings) -> ResourceResult<()> {
    let format = settings.format.parse::<LogFormat>()?;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.filter)
            .map_err(|e| ResourceError::Configuration(format!("invalid log filter: {e}")))?,
    };

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Pretty => subscriber.pretty().try_init(),
        LogFormat::Compact => subscriber.compact().try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    }
    .map_err(|e| ResourceError::Initialization(format!("failed to install logger: {e}")))?;

    tracing::info!(format = ?format, "logging initialized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_rejects_bad_format() {
        let settings = LoggingSettings {
            format: "xml".into(),
            filter: "info".into(),
        };

        assert!(matches!(init(&settings), Err(ResourceError::Configuration(_))));
    }
}
