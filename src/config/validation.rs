#![allow(clippy::collapsible_if)]

use std::collections::HashSet;

use regex::Regex;

use crate::{
    config::models::{
        DestinationConfig, ErrorMappingConfig, HealthCheckConfig, ProxyConfig, RouteRule,
        TargetConfig, TrunkConfig,
    },
    core::{destination::Transport, message::SipUri},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Unknown reference '{name}' in {field}")]
    UnknownReference { field: String, name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Proxy configuration validator
pub struct ProxyConfigValidator;

impl ProxyConfigValidator {
    /// Validate the entire configuration, collecting every problem found
    pub fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.transaction.timeout_duration().is_none() {
            errors.push(ValidationError::InvalidField {
                field: "transaction.timeout".to_string(),
                message: format!("'{}' is not a valid duration", config.transaction.timeout),
            });
        }
        if config.transaction.ingress_buffer == 0 {
            errors.push(ValidationError::InvalidField {
                field: "transaction.ingress_buffer".to_string(),
                message: "Ingress buffer must hold at least one event".to_string(),
            });
        }

        if config.resolver.supported_transports.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "resolver.supported_transports".to_string(),
            });
        }
        if config.resolver.attempts == 0 {
            errors.push(ValidationError::InvalidField {
                field: "resolver.attempts".to_string(),
                message: "At least one lookup attempt is required".to_string(),
            });
        }

        if let Err(mut health_errors) = Self::validate_health_check_config(&config.health_check) {
            errors.append(&mut health_errors);
        }

        if !(100..=699).contains(&config.maintenance.status_code) {
            errors.push(ValidationError::InvalidField {
                field: "maintenance.status_code".to_string(),
                message: format!("{} is not a response status", config.maintenance.status_code),
            });
        }

        let mut policy_names = HashSet::new();
        for mapping in &config.error_mappings {
            policy_names.insert(mapping.name.as_str());
            if let Err(mut mapping_errors) = Self::validate_error_mapping(mapping) {
                errors.append(&mut mapping_errors);
            }
        }

        if let Some(name) = &config.default_error_mapping {
            if !policy_names.contains(name.as_str()) {
                errors.push(ValidationError::UnknownReference {
                    field: "default_error_mapping".to_string(),
                    name: name.clone(),
                });
            }
        }

        for (name, trunk) in &config.trunks {
            if let Err(mut trunk_errors) =
                Self::validate_trunk(name, trunk, &config.resolver.supported_transports)
            {
                errors.append(&mut trunk_errors);
            }
            if let Some(policy) = &trunk.error_mapping {
                if !policy_names.contains(policy.as_str()) {
                    errors.push(ValidationError::UnknownReference {
                        field: format!("trunks.{name}.error_mapping"),
                        name: policy.clone(),
                    });
                }
            }
        }

        for (index, route) in config.routes.iter().enumerate() {
            if let Err(mut route_errors) = Self::validate_route(index, route, config) {
                errors.append(&mut route_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_health_check_config(
        config: &HealthCheckConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if config.enabled {
            if config.interval_secs == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "health_check.interval_secs".to_string(),
                    message: "Interval must be greater than 0".to_string(),
                });
            }
            if config.timeout_secs == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "health_check.timeout_secs".to_string(),
                    message: "Timeout must be greater than 0".to_string(),
                });
            }
            if config.unhealthy_threshold == 0 || config.healthy_threshold == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "health_check thresholds".to_string(),
                    message: "Thresholds must be greater than 0".to_string(),
                });
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_error_mapping(mapping: &ErrorMappingConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if mapping.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "error_mappings.name".to_string(),
            });
        }
        for (index, rule) in mapping.rules.iter().enumerate() {
            let field = format!("error_mappings.{}.rules[{index}]", mapping.name);
            if rule.codes.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: field.clone(),
                    message: "Rule must list at least one code".to_string(),
                });
            }
            if !(100..=699).contains(&rule.code) {
                errors.push(ValidationError::InvalidField {
                    field,
                    message: format!("Mapped code {} is not a response status", rule.code),
                });
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_trunk(
        name: &str,
        trunk: &TrunkConfig,
        supported: &[Transport],
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        match &trunk.target {
            TargetConfig::Static { destinations } => {
                if destinations.is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("trunks.{name}.target.destinations"),
                    });
                }
                for destination in destinations {
                    if let Err(e) = Self::validate_destination(name, destination, supported) {
                        errors.push(e);
                    }
                }
            }
            TargetConfig::Resolve {
                name: target,
                transport,
                ..
            } => {
                if target.trim().is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("trunks.{name}.target.name"),
                    });
                }
                if let Some(transport) = transport {
                    if !supported.contains(transport) {
                        errors.push(ValidationError::InvalidField {
                            field: format!("trunks.{name}.target.transport"),
                            message: format!("Transport {transport} is not supported"),
                        });
                    }
                }
            }
        }

        if let Some(codes) = &trunk.failover_codes {
            if let Some(code) = codes.iter().find(|code| !(100..=699).contains(*code)) {
                errors.push(ValidationError::InvalidField {
                    field: format!("trunks.{name}.failover_codes"),
                    message: format!("{code} is not a response status"),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_destination(
        trunk: &str,
        destination: &DestinationConfig,
        supported: &[Transport],
    ) -> ValidationResult<()> {
        let field = format!("trunks.{trunk}.target.destinations");
        if !(0.0..=1.0).contains(&destination.preference) {
            return Err(ValidationError::InvalidField {
                field,
                message: format!(
                    "Preference {} for '{}' must be within [0.0, 1.0]",
                    destination.preference, destination.uri
                ),
            });
        }
        let uri = SipUri::parse(&destination.uri).map_err(|e| ValidationError::InvalidField {
            field: field.clone(),
            message: e.to_string(),
        })?;
        let transport = Transport::for_uri(&uri).map_err(|e| ValidationError::InvalidField {
            field: field.clone(),
            message: e.to_string(),
        })?;
        if !supported.contains(&transport) {
            return Err(ValidationError::InvalidField {
                field,
                message: format!("Transport {transport} of '{}' is not supported", destination.uri),
            });
        }
        Ok(())
    }

    fn validate_route(
        index: usize,
        route: &RouteRule,
        config: &ProxyConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if let Err(e) = Regex::new(&route.pattern) {
            errors.push(ValidationError::InvalidField {
                field: format!("routes[{index}].pattern"),
                message: e.to_string(),
            });
        }
        if !config.trunks.contains_key(&route.trunk) {
            errors.push(ValidationError::UnknownReference {
                field: format!("routes[{index}].trunk"),
                name: route.trunk.clone(),
            });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }
        let mut message = format!("{} configuration errors found:", errors.len());
        for (index, error) in errors.iter().enumerate() {
            message.push_str(&format!("\n  {}. {}", index + 1, error));
        }
        message
    }
}
