//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::NetConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<NetConfig, ConfigError> {
    let config: NetConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<NetConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_document_with_defaults() {
        let config = parse_config(
            r#"
            [tcp]
            retry_interval_standard_ms = 250

            [udp]
            num_cpus = 4

            [rate_limits.public]
            requests_per_second = 20
            burst_size = 40
            deny = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();

        assert_eq!(config.tcp.retry_interval_standard_ms, 250);
        assert_eq!(config.tcp.retry_interval_max_ms, 30_000);
        assert_eq!(config.udp.effective_cpus(), 4);
        assert_eq!(config.rate_limits["public"].deny, vec!["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = parse_config("[udp]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert!(err.to_string().contains("udp.poll_interval_ms"));
    }

    #[test]
    fn reports_syntax_errors() {
        assert!(matches!(parse_config("[tcp"), Err(ConfigError::Parse(_))));
    }
}
