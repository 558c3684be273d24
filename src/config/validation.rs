#![allow(clippy::collapsible_if)]

use std::net::{IpAddr, SocketAddr};

use eyre::Result;

use crate::config::models::{
    COLLECTOR_SWITCH_ES, CollectorConfig, EtcdConfig, GatewayConfig, LOAD_BALANCE_MODE_IP_HASH,
    LOAD_BALANCE_MODE_RANDOM, LOAD_BALANCE_MODE_ROUND_ROBIN, LOAD_BALANCE_MODE_WEIGHT,
    RestrictorConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Load balance modes the gateway ships with.
pub const KNOWN_LOAD_BALANCE_MODES: [&str; 4] = [
    LOAD_BALANCE_MODE_RANDOM,
    LOAD_BALANCE_MODE_IP_HASH,
    LOAD_BALANCE_MODE_WEIGHT,
    LOAD_BALANCE_MODE_ROUND_ROBIN,
];

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Unknown load balance mode '{mode}' for {scope}")]
    UnknownLoadBalanceMode { mode: String, scope: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every problem found.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.reverse_host.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "reverse_host".to_string(),
            });
        }

        errors.extend(Self::validate_load_balance_modes(config));
        errors.extend(Self::validate_etcd(&config.etcd));
        errors.extend(Self::validate_restrictor(&config.restrictor));

        if config.open_collector {
            errors.extend(Self::validate_collector(&config.collector));
        }

        if !config.default_url.is_empty() {
            if let Err(e) = Self::validate_host_url(&config.default_url, "default_url") {
                errors.push(e);
            }
        }

        for ip in &config.ip_table {
            if ip.parse::<IpAddr>().is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "ip_table".to_string(),
                    message: format!("'{ip}' is not an IP address"),
                });
            }
        }

        if config.route_cache.default_expiration == 0 {
            errors.push(ValidationError::InvalidField {
                field: "route_cache.default_expiration".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.route_cache.clean_up_interval == 0 {
            errors.push(ValidationError::InvalidField {
                field: "route_cache.clean_up_interval".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_load_balance_modes(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !KNOWN_LOAD_BALANCE_MODES.contains(&config.load_balance_mode.as_str()) {
            errors.push(ValidationError::UnknownLoadBalanceMode {
                mode: config.load_balance_mode.clone(),
                scope: "load_balance_mode".to_string(),
            });
        }

        for host in &config.reverse_host {
            if host.service_name.is_empty() || host.service_name.contains('/') {
                errors.push(ValidationError::InvalidField {
                    field: "reverse_host.service_name".to_string(),
                    message: format!(
                        "'{}' must be a non-empty single path segment",
                        host.service_name
                    ),
                });
            }
            if let Some(mode) = &host.load_balance_mode {
                if !KNOWN_LOAD_BALANCE_MODES.contains(&mode.as_str()) {
                    errors.push(ValidationError::UnknownLoadBalanceMode {
                        mode: mode.clone(),
                        scope: format!("service '{}'", host.service_name),
                    });
                }
            }
        }
        errors
    }

    fn validate_etcd(etcd: &EtcdConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if etcd.endpoints.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "etcd.endpoints".to_string(),
            });
        }
        for endpoint in &etcd.endpoints {
            if let Err(e) = Self::validate_host_url(endpoint, "etcd.endpoints") {
                errors.push(e);
            }
        }
        if etcd.local_cache_default_expiration == 0 {
            errors.push(ValidationError::InvalidField {
                field: "etcd.local_cache_default_expiration".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if etcd.local_cache_clean_up_time == 0 {
            errors.push(ValidationError::InvalidField {
                field: "etcd.local_cache_clean_up_time".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_restrictor(restrictor: &RestrictorConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !restrictor.open {
            return errors;
        }
        if restrictor.rate == 0 {
            errors.push(ValidationError::InvalidField {
                field: "restrictor.rate".to_string(),
                message: "Must be greater than 0 when the restrictor is open".to_string(),
            });
        }
        if restrictor.max_token == 0 {
            errors.push(ValidationError::InvalidField {
                field: "restrictor.max_token".to_string(),
                message: "Must be greater than 0 when the restrictor is open".to_string(),
            });
        }
        errors
    }

    fn validate_collector(collector: &CollectorConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if collector.switch.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "collector.switch".to_string(),
            });
        } else if collector.switch != COLLECTOR_SWITCH_ES {
            errors.push(ValidationError::InvalidField {
                field: "collector.switch".to_string(),
                message: format!("collector '{}' does not exist", collector.switch),
            });
        }

        let es = &collector.es;
        for (field, value) in [
            ("collector.es.bulk_max_count", es.bulk_max_count),
            ("collector.es.queue_capacity", es.queue_capacity),
            ("collector.es.max_flush_workers", es.max_flush_workers),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }
        if es.flush_interval == 0 {
            errors.push(ValidationError::InvalidField {
                field: "collector.es.flush_interval".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if es.index.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "collector.es.index".to_string(),
            });
        }
        if let Err(e) = Self::validate_host_url(&es.base_url(), "collector.es.host") {
            errors.push(e);
        }
        errors
    }

    /// Accepts either a bare `host[:port]` or an http(s) URL.
    fn validate_host_url(value: &str, context: &str) -> ValidationResult<()> {
        let candidate = if value.contains("://") {
            value.to_string()
        } else {
            format!("http://{value}")
        };

        match url::Url::parse(&candidate) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
