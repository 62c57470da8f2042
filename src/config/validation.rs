//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, ports ordered)
//! - Check rate limit networks parse as CIDR blocks or addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NetConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::NetConfig;
use crate::security::rate_limit::parse_network;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &NetConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let tcp = &config.tcp;
    if tcp.retry_interval_standard_ms == 0 {
        errors.push(ValidationError::new("tcp.retry_interval_standard_ms", "must be > 0"));
    }
    if tcp.retry_interval_max_ms < tcp.retry_interval_standard_ms {
        errors.push(ValidationError::new(
            "tcp.retry_interval_max_ms",
            "must be >= retry_interval_standard_ms",
        ));
    }
    if tcp.random_port_attempts == 0 {
        errors.push(ValidationError::new("tcp.random_port_attempts", "must be > 0"));
    }
    if tcp.listen_backlog == 0 {
        errors.push(ValidationError::new("tcp.listen_backlog", "must be > 0"));
    }

    let udp = &config.udp;
    if udp.num_cpus == Some(0) {
        errors.push(ValidationError::new("udp.num_cpus", "must be > 0 when set"));
    }
    if udp.poll_interval_ms == 0 {
        errors.push(ValidationError::new("udp.poll_interval_ms", "must be > 0"));
    }
    if udp.bind_retry_max_ms < udp.bind_retry_base_ms {
        errors.push(ValidationError::new(
            "udp.bind_retry_max_ms",
            "must be >= bind_retry_base_ms",
        ));
    }
    if udp.recv_batch == 0 || udp.send_batch == 0 {
        errors.push(ValidationError::new("udp.recv_batch/send_batch", "must be > 0"));
    }
    if udp.max_datagram_size == 0 {
        errors.push(ValidationError::new("udp.max_datagram_size", "must be > 0"));
    }

    let ports = &config.random_ports;
    if ports.first == 0 || ports.first > ports.last {
        errors.push(ValidationError::new(
            "random_ports",
            format!("invalid range {}..={}", ports.first, ports.last),
        ));
    }

    if config.pipe.stream_buffer_bytes == 0 || config.pipe.datagram_queue_capacity == 0 {
        errors.push(ValidationError::new("pipe", "buffer sizes must be > 0"));
    }

    for (name, profile) in &config.rate_limits {
        if profile.requests_per_second == 0 || profile.burst_size == 0 {
            errors.push(ValidationError::new(
                format!("rate_limits.{name}"),
                "requests_per_second and burst_size must be > 0",
            ));
        }
        for net in profile.deny.iter().chain(profile.exempt.iter()) {
            if parse_network(net).is_none() {
                errors.push(ValidationError::new(
                    format!("rate_limits.{name}"),
                    format!("invalid network {net:?}"),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RateLimitConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&NetConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = NetConfig::default();
        config.tcp.retry_interval_max_ms = 10;
        config.random_ports.first = 5000;
        config.random_ports.last = 4000;
        config.rate_limits.insert(
            "edge".into(),
            RateLimitConfig {
                deny: vec!["10.0.0.0/33".into()],
                ..RateLimitConfig::default()
            },
        );

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.field == "rate_limits.edge"));
    }
}
